//! Shared data types passed between capture, analysis and publishing stages.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::interfaces::InterfaceId;

/// Parameters for a single capture iteration.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub window: Duration,
    pub output_dir: PathBuf,
    pub interfaces: Vec<InterfaceId>,
}

/// A completed packet capture on disk, ready for analysis.
#[derive(Debug, Clone)]
pub struct TraceArtifact {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Per-iteration metadata carried alongside whatever logs the analyzer produced.
#[derive(Debug, Clone)]
pub struct BundleMetadata {
    pub iteration_timestamp: DateTime<Utc>,
    pub source_trace: PathBuf,
    pub sampling_percentage: u8,
}

/// The output of running the trace analyzer over one [`TraceArtifact`].
///
/// A field is `None` when the analyzer did not produce that particular log
/// for this iteration (e.g. no DNS traffic observed) — this is not an error.
#[derive(Debug, Clone)]
pub struct ProcessedBundle {
    pub connection_log: Option<PathBuf>,
    pub dns_log: Option<PathBuf>,
    pub extra_logs: BTreeMap<String, PathBuf>,
    pub metadata: BundleMetadata,
}

impl ProcessedBundle {
    /// Iterates over every present log as `(name, path)` pairs, in a stable
    /// order (`conn`, `dns`, then extras alphabetically) so that envelope
    /// construction is deterministic.
    pub fn artifacts(&self) -> Vec<(String, PathBuf)> {
        let mut out = Vec::new();
        if let Some(p) = &self.connection_log {
            out.push(("conn".to_string(), p.clone()));
        }
        if let Some(p) = &self.dns_log {
            out.push(("dns".to_string(), p.clone()));
        }
        for (name, path) in &self.extra_logs {
            out.push((name.clone(), path.clone()));
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.connection_log.is_none() && self.dns_log.is_none() && self.extra_logs.is_empty()
    }
}

/// A fully-built, opaque payload ready to hand to the publisher transport.
#[derive(Debug, Clone)]
pub struct UploadEnvelope {
    pub sensor_id: String,
    pub compressed: Vec<u8>,
}

/// A previously-built envelope persisted to the buffer directory because the
/// publisher was unreachable at the time.
#[derive(Debug, Clone)]
pub struct BufferedEnvelope {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Outcome of handing an envelope to the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered,
    Buffered,
    /// The publisher rejected this sensor permanently (e.g. revoked API key).
    /// Callers should stop trying to publish entirely.
    Terminal,
}

/// Outcome of one orchestrator/watcher run, surfaced to the CLI for exit-code mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    TerminalRevoked,
}
