//! Trace analysis: runs the external traffic analyzer over a capture and
//! collects whichever structured logs it produced.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::capture::command::CommandFactory;
use crate::model::{BundleMetadata, ProcessedBundle, TraceArtifact};

#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error("trace analyzer binary not found on PATH")]
    AnalyzerMissing,
    #[error("trace analyzer exited with status {status}: {stderr}")]
    AnalyzerFailed { status: i32, stderr: String },
    #[error("failed to rename {from} to {to}: {source}")]
    RenameFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Fixed candidate locations probed, in order, for the sampling script used
/// when `sampling_percentage < 100`. The first one that exists is used.
const SAMPLING_SCRIPT_CANDIDATES: &[&str] = &[
    "/usr/local/zeek/share/zeek/site/sampling/sampling.zeek",
    "/opt/zeek/share/zeek/site/sampling/sampling.zeek",
    "./sampling.zeek",
];

const EXPECTED_LOGS: &[&str] = &["conn", "dns"];

async fn find_sampling_script() -> Option<PathBuf> {
    for candidate in SAMPLING_SCRIPT_CANDIDATES {
        let path = PathBuf::from(candidate);
        if tokio::fs::metadata(&path).await.is_ok() {
            return Some(path);
        }
    }
    None
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        trace: &TraceArtifact,
        sampling_percentage: u8,
    ) -> Result<ProcessedBundle, AnalyzeError>;
}

pub struct ZeekAnalyzer {
    command_factory: CommandFactory,
    binary: &'static str,
    extra_log_names: Vec<String>,
}

impl ZeekAnalyzer {
    pub fn new(command_factory: CommandFactory, extra_log_names: Vec<String>) -> Self {
        Self {
            command_factory,
            binary: "zeek",
            extra_log_names,
        }
    }
}

#[async_trait]
impl Analyzer for ZeekAnalyzer {
    async fn analyze(
        &self,
        trace: &TraceArtifact,
        sampling_percentage: u8,
    ) -> Result<ProcessedBundle, AnalyzeError> {
        let log_dir = trace
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut cmd = (self.command_factory)(self.binary);
        cmd.arg("-r").arg(&trace.path).current_dir(&log_dir);

        if sampling_percentage < 100 {
            if let Some(script) = find_sampling_script().await {
                cmd.arg(script);
                cmd.env("SAMPLING_PERCENTAGE", sampling_percentage.to_string());
            }
        }

        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AnalyzeError::AnalyzerMissing
            } else {
                AnalyzeError::AnalyzerFailed {
                    status: -1,
                    stderr: e.to_string(),
                }
            }
        })?;
        if !output.status.success() {
            return Err(AnalyzeError::AnalyzerFailed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        let mut connection_log = None;
        let mut dns_log = None;
        let mut extra_logs = BTreeMap::new();

        let names = EXPECTED_LOGS
            .iter()
            .copied()
            .chain(self.extra_log_names.iter().map(|s| s.as_str()));
        for name in names {
            let src = log_dir.join(format!("{name}.log"));
            if tokio::fs::metadata(&src).await.is_err() {
                continue;
            }
            let dst = log_dir.join(format!("{name}.xlsx"));
            tokio::fs::rename(&src, &dst)
                .await
                .map_err(|source| AnalyzeError::RenameFailed {
                    from: src.clone(),
                    to: dst.clone(),
                    source,
                })?;
            match name {
                "conn" => connection_log = Some(dst),
                "dns" => dns_log = Some(dst),
                other => {
                    extra_logs.insert(other.to_string(), dst);
                }
            }
        }

        Ok(ProcessedBundle {
            connection_log,
            dns_log,
            extra_logs,
            metadata: BundleMetadata {
                iteration_timestamp: Utc::now(),
                source_trace: trace.path.clone(),
                sampling_percentage,
            },
        })
    }
}
