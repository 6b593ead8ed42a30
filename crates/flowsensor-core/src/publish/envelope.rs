//! Builds the opaque, doubly-compressed payload sent to the publisher.
//!
//! Per artifact: read the file, gzip it, base64-encode the compressed bytes.
//! The per-artifact map is then JSON-serialized and gzipped a second time.
//! If the result still exceeds `max_payload_size`, the bundle is split into
//! one envelope per artifact; an artifact whose own envelope still exceeds
//! the threshold is a [`EnvelopeError::ArtifactTooLarge`] (surfaced, not
//! truncated).

use std::collections::BTreeMap;
use std::io::Write;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

use crate::model::{ProcessedBundle, UploadEnvelope};

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to read artifact {0}: {1}")]
    ReadFailed(std::path::PathBuf, std::io::Error),
    #[error("failed to compress payload: {0}")]
    CompressFailed(std::io::Error),
    #[error("failed to serialize envelope: {0}")]
    SerializeFailed(#[from] serde_json::Error),
    #[error("artifact {name} is {size} bytes, which exceeds the {limit}-byte payload limit even on its own")]
    ArtifactTooLarge {
        name: String,
        size: usize,
        limit: usize,
    },
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .map_err(EnvelopeError::CompressFailed)?;
    encoder.finish().map_err(EnvelopeError::CompressFailed)
}

async fn encode_artifact(path: &std::path::Path) -> Result<String, EnvelopeError> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| EnvelopeError::ReadFailed(path.to_path_buf(), e))?;
    let compressed = gzip(&raw)?;
    Ok(BASE64.encode(compressed))
}

fn build_single(fields: BTreeMap<String, String>) -> Result<Vec<u8>, EnvelopeError> {
    let json = serde_json::to_vec(&fields)?;
    gzip(&json)
}

/// Builds one or more envelopes for a bundle, splitting by artifact when the
/// combined envelope would exceed `max_payload_size` bytes.
pub async fn build_envelopes(
    bundle: &ProcessedBundle,
    sensor_id: &str,
    max_payload_size: usize,
) -> Result<Vec<UploadEnvelope>, EnvelopeError> {
    let artifacts = bundle.artifacts();
    let mut fields = BTreeMap::new();
    for (name, path) in &artifacts {
        fields.insert(name.clone(), encode_artifact(path).await?);
    }

    let combined = build_single(fields.clone())?;
    if combined.len() <= max_payload_size {
        return Ok(vec![UploadEnvelope {
            sensor_id: sensor_id.to_string(),
            compressed: combined,
        }]);
    }

    let mut out = Vec::with_capacity(fields.len());
    for (name, encoded) in fields {
        let mut single = BTreeMap::new();
        single.insert(name.clone(), encoded);
        let compressed = build_single(single)?;
        if compressed.len() > max_payload_size {
            return Err(EnvelopeError::ArtifactTooLarge {
                name,
                size: compressed.len(),
                limit: max_payload_size,
            });
        }
        out.push(UploadEnvelope {
            sensor_id: sensor_id.to_string(),
            compressed,
        });
    }
    Ok(out)
}
