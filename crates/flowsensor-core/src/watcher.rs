//! Poll-directory alternative front-end: watches for externally-dropped
//! capture files instead of invoking a capturer itself. Mutually exclusive
//! with [`crate::orchestrator::Orchestrator`] at runtime.
//!
//! The poll/ticker shape mirrors the orchestrator's producer loop, adapted
//! from a one-second telemetry ticker to a directory scan on a configurable
//! interval.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::analyze::Analyzer;
use crate::model::{RunOutcome, TraceArtifact};
use crate::publish::PublisherClient;

const SUBDIRS: &[&str] = &["incoming", "processing", "processed", "failed"];

pub struct Watcher {
    pub watch_dir: PathBuf,
    pub poll_interval: Duration,
    pub stable_seconds: Duration,
    pub analyzer: Arc<dyn Analyzer>,
    /// `None` when `enigma_api.upload` is disabled (capture-only mode).
    pub publisher: Option<Arc<PublisherClient>>,
    pub sensor_id: String,
    pub sampling_percentage: u8,
    pub max_payload_size: usize,
}

impl Watcher {
    pub async fn run(&self, ctx: CancellationToken) -> Result<RunOutcome> {
        for sub in SUBDIRS {
            tokio::fs::create_dir_all(self.watch_dir.join(sub))
                .await
                .with_context(|| format!("failed to create watch subdirectory {sub}"))?;
        }

        let mut ticker = interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = ctx.cancelled() => return Ok(RunOutcome::Completed),
            }

            let files = match self.list_incoming().await {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, "failed to list incoming directory");
                    continue;
                }
            };

            for file in files {
                if ctx.is_cancelled() {
                    return Ok(RunOutcome::Completed);
                }
                if !self.is_stable(&file).await {
                    continue;
                }
                match self.process_one(&ctx, &file).await {
                    Ok(RunOutcome::TerminalRevoked) => return Ok(RunOutcome::TerminalRevoked),
                    Ok(RunOutcome::Completed) => {}
                    Err(e) => warn!(error = %e, path = %file.display(), "failed to process incoming capture"),
                }
            }
        }
    }

    async fn list_incoming(&self) -> std::io::Result<Vec<PathBuf>> {
        let incoming = self.watch_dir.join("incoming");
        let mut entries = tokio::fs::read_dir(&incoming).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str()).map(|s| s.to_lowercase());
            if matches!(ext.as_deref(), Some("pcap") | Some("pcapng")) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn is_stable(&self, path: &Path) -> bool {
        let Ok(before) = tokio::fs::metadata(path).await else {
            return false;
        };
        tokio::time::sleep(self.stable_seconds).await;
        let Ok(after) = tokio::fs::metadata(path).await else {
            return false;
        };
        before.len() == after.len() && before.modified().ok() == after.modified().ok()
    }

    async fn process_one(&self, ctx: &CancellationToken, file: &Path) -> Result<RunOutcome> {
        let name = file
            .file_name()
            .context("incoming file has no file name")?
            .to_owned();
        let processing = self.watch_dir.join("processing").join(&name);
        tokio::fs::rename(file, &processing)
            .await
            .context("failed to move capture into processing/")?;

        let trace = TraceArtifact {
            path: processing.clone(),
            created_at: chrono::Utc::now(),
        };

        let bundle = match self.analyzer.analyze(&trace, self.sampling_percentage).await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "analysis failed, moving capture to failed/");
                let failed = self.watch_dir.join("failed").join(&name);
                let _ = tokio::fs::rename(&processing, &failed).await;
                return Ok(RunOutcome::Completed);
            }
        };

        let mut terminal = false;
        if !bundle.is_empty() {
            if let Some(publisher) = &self.publisher {
                let envelopes = crate::publish::build_envelopes(
                    &bundle,
                    &self.sensor_id,
                    self.max_payload_size,
                )
                .await;
                match envelopes {
                    Ok(envelopes) => {
                        for envelope in envelopes {
                            if let Ok(crate::model::PublishOutcome::Terminal) =
                                publisher.upload(ctx, &envelope).await
                            {
                                terminal = true;
                                break;
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to build upload envelope"),
                }
            }
        }

        // Whether publishing succeeded, was buffered, skipped (capture-only
        // mode) or was terminally revoked, the file still moves to
        // processed/ — a terminal revocation stops the watcher, not this
        // file's bookkeeping.
        let processed = self.watch_dir.join("processed").join(&name);
        tokio::fs::rename(&processing, &processed)
            .await
            .context("failed to move capture into processed/")?;
        info!(path = %processed.display(), "watcher finished processing capture");

        if terminal {
            return Ok(RunOutcome::TerminalRevoked);
        }
        Ok(RunOutcome::Completed)
    }
}
