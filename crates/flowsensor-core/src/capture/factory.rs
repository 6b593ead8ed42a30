//! Selects the right [`TraceCapturer`] implementation for the host OS.

use std::sync::Arc;

use super::command::default_command_factory;
use super::TraceCapturer;

#[cfg(unix)]
pub fn build_capturer() -> Arc<dyn TraceCapturer> {
    Arc::new(super::unix::UnixCapturer::new(default_command_factory()))
}

#[cfg(windows)]
pub fn build_capturer() -> Arc<dyn TraceCapturer> {
    Arc::new(super::windows::WindowsCapturer::new(default_command_factory()))
}
