//! Injectable subprocess construction for capturers.
//!
//! Grounded on `patronus-diagnostics`'s `packet_capture.rs`, which drives
//! `tcpdump`/`capinfos`/`tshark` through `tokio::process::Command`. Here the
//! constructor is a field on each capturer rather than a free function so
//! tests can substitute a fake binary without touching process-global state.

use std::process::Stdio;
use tokio::process::Command;

/// Builds a [`Command`] for the named external tool. Stored as a boxed `Fn`
/// on each capturer/analyzer so unit tests can redirect `"tcpdump"` to a
/// fixture script.
pub type CommandFactory = Box<dyn Fn(&str) -> Command + Send + Sync>;

/// The default factory: resolves the binary by name through `PATH`, with
/// stdout/stderr piped so callers can capture diagnostics.
pub fn default_command_factory() -> CommandFactory {
    Box::new(|program: &str| {
        let mut cmd = Command::new(program);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    })
}
