//! Drives the capture -> analyze -> publish loop: one producer (this task)
//! feeding a bounded queue, one worker draining it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analyze::Analyzer;
use crate::capture::TraceCapturer;
use crate::model::{CaptureRequest, RunOutcome};
use crate::publish::PublisherClient;

const QUEUE_CAPACITY: usize = 4;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("worker task panicked: {0}")]
    WorkerPanicked(String),
}

pub struct Orchestrator {
    pub output_dir: PathBuf,
    pub window: Duration,
    pub run_loop: bool,
    pub retention: Option<Duration>,
    pub capturer: Arc<dyn TraceCapturer>,
    pub analyzer: Arc<dyn Analyzer>,
    /// `None` when `enigma_api.upload` is disabled: the pipeline still
    /// captures and analyzes but never attempts to publish (capture-only
    /// mode).
    pub publisher: Option<Arc<PublisherClient>>,
    pub sensor_id: String,
    pub interfaces: Vec<crate::interfaces::InterfaceId>,
    pub sampling_percentage: u8,
    pub max_payload_size: usize,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        output_dir: PathBuf,
        window: Duration,
        run_loop: bool,
        retention: Option<Duration>,
        capturer: Arc<dyn TraceCapturer>,
        analyzer: Arc<dyn Analyzer>,
        publisher: Option<Arc<PublisherClient>>,
        sensor_id: String,
        interfaces: Vec<crate::interfaces::InterfaceId>,
        sampling_percentage: u8,
        max_payload_size: usize,
    ) -> Self {
        Self {
            output_dir,
            window,
            run_loop,
            retention,
            capturer,
            analyzer,
            publisher,
            sensor_id,
            interfaces,
            sampling_percentage,
            max_payload_size,
        }
    }

    pub async fn run(&self, ctx: CancellationToken) -> Result<RunOutcome> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .context("failed to create capture output directory")?;

        let (tx, rx) = mpsc::channel::<PathBuf>(QUEUE_CAPACITY);
        let (terminal_tx, terminal_rx) = oneshot::channel::<()>();

        let worker = tokio::spawn(run_worker(
            rx,
            self.analyzer.clone(),
            self.publisher.clone(),
            self.sensor_id.clone(),
            self.sampling_percentage,
            self.max_payload_size,
            ctx.clone(),
            terminal_tx,
        ));

        let outcome = self.run_producer(tx, ctx.clone(), terminal_rx).await;

        // Closing `tx` (dropped at the end of run_producer) signals the
        // worker to drain and exit; wait for it before returning so no
        // in-flight trace is ever silently lost on shutdown.
        match worker.await {
            Ok(()) => {}
            Err(e) => return Err(OrchestratorError::WorkerPanicked(e.to_string()).into()),
        }

        outcome
    }

    async fn run_producer(
        &self,
        tx: mpsc::Sender<PathBuf>,
        ctx: CancellationToken,
        mut terminal_rx: oneshot::Receiver<()>,
    ) -> Result<RunOutcome> {
        loop {
            if let Err(oneshot::error::TryRecvError::Empty) = terminal_rx.try_recv() {
                // still running
            } else {
                return Ok(RunOutcome::TerminalRevoked);
            }

            self.sweep_retention().await;

            if ctx.is_cancelled() {
                return Ok(RunOutcome::Completed);
            }

            let iter_dir = self
                .output_dir
                .join(format!("zeek_out_{}", Utc::now().format("%Y%m%dT%H%M%SZ")));
            if let Err(e) = tokio::fs::create_dir_all(&iter_dir).await {
                warn!(path = %iter_dir.display(), error = %e, "failed to create capture output subdirectory");
                if !self.run_loop {
                    drop(tx);
                    return Ok(RunOutcome::Completed);
                }
                continue;
            }

            let req = CaptureRequest {
                window: self.window,
                output_dir: iter_dir,
                interfaces: self.interfaces.clone(),
            };

            tokio::select! {
                captured = self.capturer.capture(ctx.clone(), &req) => {
                    match captured {
                        Ok(artifact) => {
                            match tx.try_send(artifact.path.clone()) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    warn!(path = %artifact.path.display(), "worker queue full, dropping capture");
                                    let _ = tokio::fs::remove_file(&artifact.path).await;
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => {
                                    return Ok(RunOutcome::Completed);
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "capture iteration failed"),
                    }
                }
                _ = ctx.cancelled() => return Ok(RunOutcome::Completed),
                _ = &mut terminal_rx => return Ok(RunOutcome::TerminalRevoked),
            }

            if !self.run_loop {
                drop(tx);
                return Ok(RunOutcome::Completed);
            }
        }
    }

    async fn sweep_retention(&self) {
        let Some(max_age) = self.retention else {
            return;
        };
        let Ok(mut entries) = tokio::fs::read_dir(&self.output_dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with("zeek_out_") {
                continue;
            }
            if let Ok(metadata) = entry.metadata().await {
                if let Ok(modified) = metadata.modified() {
                    if modified.elapsed().map(|e| e > max_age).unwrap_or(false) {
                        if let Err(e) = remove_dir(&path).await {
                            warn!(path = %path.display(), error = %e, "failed to purge expired output directory");
                        } else {
                            debug!(path = %path.display(), "purged expired output directory");
                        }
                    }
                }
            }
        }
    }
}

async fn remove_dir(path: &Path) -> std::io::Result<()> {
    tokio::fs::remove_dir_all(path).await
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    mut rx: mpsc::Receiver<PathBuf>,
    analyzer: Arc<dyn Analyzer>,
    publisher: Option<Arc<PublisherClient>>,
    sensor_id: String,
    sampling_percentage: u8,
    max_payload_size: usize,
    ctx: CancellationToken,
    terminal_tx: oneshot::Sender<()>,
) {
    while let Some(trace_path) = rx.recv().await {
        if tokio::fs::metadata(&trace_path).await.is_err() {
            warn!(path = %trace_path.display(), "queued trace no longer exists, skipping");
            continue;
        }

        let created_at = Utc::now();
        let trace = crate::model::TraceArtifact {
            path: trace_path.clone(),
            created_at,
        };

        // AnalyzerFailed / AnalyzerMissing / RenameFailed are all logged and
        // non-fatal: the trace file is preserved for forensic inspection and
        // the worker moves on to the next queued trace.
        let bundle = match analyzer.analyze(&trace, sampling_percentage).await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, path = %trace_path.display(), "analysis failed, preserving trace");
                continue;
            }
        };

        if bundle.is_empty() {
            cleanup_trace(&trace_path).await;
            continue;
        }

        let Some(publisher) = publisher.as_ref() else {
            // capture-only mode: enigma_api.upload is disabled.
            cleanup_trace(&trace_path).await;
            continue;
        };

        let envelopes =
            match crate::publish::build_envelopes(&bundle, &sensor_id, max_payload_size).await {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "failed to build upload envelope (fatal), preserving trace");
                    continue;
                }
            };

        let mut terminal = false;
        for envelope in envelopes {
            match publisher.upload(&ctx, &envelope).await {
                Ok(crate::model::PublishOutcome::Terminal) => {
                    terminal = true;
                    break;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "publish failed for envelope"),
            }
        }

        if terminal {
            // Upload did not succeed, so the trace is retained even though
            // the sensor is about to stop.
            info!(path = %trace_path.display(), "publisher revoked this sensor, stopping worker");
            let _ = terminal_tx.send(());
            return;
        }

        cleanup_trace(&trace_path).await;
        info!(path = %trace_path.display(), "iteration complete");
    }
}

/// Deletes the processed trace file, then sweeps its containing directory
/// for any other stray `.pcap`/`.etl` file left behind by a failed
/// multi-interface merge or Windows fallback conversion, and deletes those
/// too.
async fn cleanup_trace(trace_path: &Path) {
    let _ = tokio::fs::remove_file(trace_path).await;
    let Some(dir) = trace_path.parent() else {
        return;
    };
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path == trace_path {
            continue;
        }
        let is_stray = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("pcap") | Some("etl")
        );
        if is_stray {
            let _ = tokio::fs::remove_file(&path).await;
        }
    }
}
