//! Capture, analysis and upload pipeline for the flowsensor network
//! telemetry agent.

pub mod analyze;
pub mod capture;
pub mod interfaces;
pub mod model;
pub mod orchestrator;
pub mod publish;
pub mod watcher;

pub use analyze::{AnalyzeError, Analyzer, ZeekAnalyzer};
pub use capture::{CaptureError, TraceCapturer};
pub use interfaces::{parse_interfaces, InterfaceError, InterfaceId};
pub use model::{
    BufferedEnvelope, BundleMetadata, CaptureRequest, ProcessedBundle, PublishOutcome, RunOutcome,
    TraceArtifact, UploadEnvelope,
};
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use publish::{EnvelopeBuffer, EnvelopeError, PublishError, PublisherClient, ReqwestTransport};
pub use watcher::Watcher;
