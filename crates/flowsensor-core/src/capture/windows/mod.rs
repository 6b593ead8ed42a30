//! Windows capture backend: a user-space promiscuous-mode capture library is
//! preferred, falling back to the platform's kernel tracing utility when the
//! library is unavailable at startup. Capability detection happens once, in
//! [`WindowsCapturer::new`].

mod fallback;
mod iface_map;
mod promiscuous;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::command::CommandFactory;
use super::{CaptureError, CaptureState, TraceCapturer};
use crate::model::{CaptureRequest, TraceArtifact};

pub use iface_map::map_interface_name;

enum Backend {
    Promiscuous(promiscuous::PromiscuousBackend),
    Fallback(fallback::FallbackBackend),
}

pub struct WindowsCapturer {
    backend: Backend,
    state: CaptureState,
}

impl WindowsCapturer {
    /// Detects whether the promiscuous-mode capture library is usable on
    /// this host and selects a backend accordingly.
    pub fn new(command_factory: CommandFactory) -> Self {
        let backend = if promiscuous::is_available() {
            Backend::Promiscuous(promiscuous::PromiscuousBackend::new())
        } else {
            Backend::Fallback(fallback::FallbackBackend::new(command_factory))
        };
        Self {
            backend,
            state: CaptureState::new(),
        }
    }
}

#[async_trait]
impl TraceCapturer for WindowsCapturer {
    async fn capture(
        &self,
        ctx: CancellationToken,
        req: &CaptureRequest,
    ) -> Result<TraceArtifact, CaptureError> {
        if !self.state.try_start() {
            return Err(CaptureError::AlreadyCapturing);
        }
        let result = match &self.backend {
            Backend::Promiscuous(b) => b.capture(ctx, req).await,
            Backend::Fallback(b) => b.capture(ctx, req).await,
        };
        self.state.finish();
        result
    }
}
