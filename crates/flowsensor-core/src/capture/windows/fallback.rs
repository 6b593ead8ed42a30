//! Fallback Windows backend used when the promiscuous-mode capture library
//! is unavailable (no supported driver installed): drives the built-in
//! `pktmon` kernel packet monitor instead.
//!
//! Structurally mirrors [`crate::capture::unix::UnixCapturer`]: spawn, wait
//! out the window (or a cancellation), stop, then convert the trace to pcap.

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::capture::command::CommandFactory;
use crate::capture::{CaptureError, TraceCapturer};
use crate::model::{CaptureRequest, TraceArtifact};

pub struct FallbackBackend {
    command_factory: CommandFactory,
    tool: &'static str,
}

impl FallbackBackend {
    pub fn new(command_factory: CommandFactory) -> Self {
        Self {
            command_factory,
            tool: "pktmon",
        }
    }

    async fn run_tool(&self, args: &[&str]) -> Result<(), CaptureError> {
        let mut cmd = (self.command_factory)(self.tool);
        cmd.args(args);
        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CaptureError::ToolMissing(self.tool)
            } else {
                CaptureError::Io(e)
            }
        })?;
        if !output.status.success() {
            return Err(CaptureError::ToolFailed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TraceCapturer for FallbackBackend {
    async fn capture(
        &self,
        ctx: CancellationToken,
        req: &CaptureRequest,
    ) -> Result<TraceArtifact, CaptureError> {
        let created_at = Utc::now();
        let etl_path = req
            .output_dir
            .join(format!("capture_{}.etl", created_at.format("%Y%m%dT%H%M%SZ")));
        let pcap_path = etl_path.with_extension("pcap");

        self.run_tool(&["start", "--capture", "--file", etl_path.to_str().unwrap_or_default()])
            .await?;

        tokio::select! {
            _ = sleep(req.window) => {}
            _ = ctx.cancelled() => {}
        }

        self.run_tool(&["stop"]).await?;

        if ctx.is_cancelled() {
            let _ = tokio::fs::remove_file(&etl_path).await;
            return Err(CaptureError::Cancelled);
        }

        // The conversion step reads from `etl_path`; verifying it separately
        // from "the conversion tool failed" lets callers tell "pktmon wrote
        // nothing" apart from "pktmon's converter itself is broken".
        match tokio::fs::metadata(&etl_path).await {
            Ok(meta) if meta.len() > 0 => {}
            _ => return Err(CaptureError::TraceVerificationFailed(etl_path.clone())),
        }

        self.run_tool(&[
            "pcapng",
            etl_path.to_str().unwrap_or_default(),
            pcap_path.to_str().unwrap_or_default(),
        ])
        .await?;
        let _ = tokio::fs::remove_file(&etl_path).await;

        Ok(TraceArtifact {
            path: pcap_path,
            created_at,
        })
    }
}
