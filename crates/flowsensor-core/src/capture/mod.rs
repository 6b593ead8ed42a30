//! Trace capture: invokes a platform-specific capture backend and produces a
//! single [`TraceArtifact`] per call.

pub mod command;
pub mod factory;
#[cfg(unix)]
pub mod unix;
#[cfg(windows)]
pub mod windows;

use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::model::{CaptureRequest, TraceArtifact};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("a capture is already running on this capturer")]
    AlreadyCapturing,
    #[error("capture utility {0} not found on PATH")]
    ToolMissing(&'static str),
    #[error("capture utility exited with status {status}: {stderr}")]
    ToolFailed { status: i32, stderr: String },
    #[error("no merge tool available to combine {0} interface captures")]
    MergeToolMissing(usize),
    #[error("intermediate trace {0} is missing or empty, cannot convert to pcap")]
    TraceVerificationFailed(std::path::PathBuf),
    #[error("capture was cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Capture state machine: `Idle -> Running -> {Completed, Failed, Cancelled} -> Idle`.
/// A second concurrent call while `Running` is rejected rather than queued.
#[derive(Debug)]
pub(crate) struct CaptureState(AtomicU8);

const IDLE: u8 = 0;
const RUNNING: u8 = 1;

impl CaptureState {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(IDLE))
    }

    /// Attempts to transition `Idle -> Running`. Returns `false` if a capture
    /// is already in flight.
    pub(crate) fn try_start(&self) -> bool {
        self.0
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Transitions back to `Idle` regardless of how the capture ended
    /// (`Completed`/`Failed`/`Cancelled` all return the capturer to `Idle`).
    pub(crate) fn finish(&self) {
        self.0.store(IDLE, Ordering::Release);
    }
}

#[async_trait]
pub trait TraceCapturer: Send + Sync {
    async fn capture(
        &self,
        ctx: CancellationToken,
        req: &CaptureRequest,
    ) -> Result<TraceArtifact, CaptureError>;
}
