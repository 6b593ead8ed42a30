//! Injectable HTTP transport for the publisher client, plus the retry and
//! buffering policy layered on top of it.
//!
//! The transport is an `async_trait` abstraction over the HTTP call so
//! tests can substitute a `wiremock` server without touching global state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use super::buffer::EnvelopeBuffer;
use crate::model::{PublishOutcome, UploadEnvelope};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to buffer envelope to disk: {0}")]
    BufferWrite(std::io::Error),
    #[error("publish was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOutcome {
    Delivered,
    Transient,
    Terminal,
}

#[async_trait]
pub trait PublisherTransport: Send + Sync {
    async fn send(&self, envelope: &[u8]) -> Result<TransportOutcome, String>;
}

#[derive(Serialize)]
struct WireRequest<'a> {
    data: &'a str,
    employee_id: &'a str,
}

#[derive(Deserialize)]
struct WireResponse {
    status_code: u16,
    #[allow(dead_code)]
    status: Option<String>,
    #[allow(dead_code)]
    message: Option<String>,
}

pub struct ReqwestTransport {
    client: reqwest::Client,
    endpoint: Url,
    api_key: String,
    terminal_status_code: u16,
}

impl ReqwestTransport {
    pub fn new(endpoint: Url, api_key: String, terminal_status_code: u16) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            terminal_status_code,
        }
    }
}

#[async_trait]
impl PublisherTransport for ReqwestTransport {
    async fn send(&self, envelope: &[u8]) -> Result<TransportOutcome, String> {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;

        let body = WireRequest {
            data: &BASE64.encode(envelope),
            employee_id: &self.api_key,
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status().as_u16();
        let parsed: Option<WireResponse> = response.json().await.ok();
        let reported_status = parsed.map(|r| r.status_code).unwrap_or(status);

        if reported_status == 200 {
            Ok(TransportOutcome::Delivered)
        } else if reported_status == self.terminal_status_code {
            Ok(TransportOutcome::Terminal)
        } else {
            Ok(TransportOutcome::Transient)
        }
    }
}

pub struct PublisherClient {
    transport: Arc<dyn PublisherTransport>,
    buffer: EnvelopeBuffer,
    retry_count: u32,
    retry_delay: Duration,
}

impl PublisherClient {
    pub fn new(
        transport: Arc<dyn PublisherTransport>,
        buffer: EnvelopeBuffer,
        retry_count: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            transport,
            buffer,
            retry_count,
            retry_delay,
        }
    }

    #[instrument(skip_all)]
    pub async fn upload(
        &self,
        ctx: &CancellationToken,
        envelope: &UploadEnvelope,
    ) -> Result<PublishOutcome, PublishError> {
        if let Some(outcome) = self.buffer.flush(&self.transport, ctx).await? {
            return Ok(outcome);
        }

        match self.attempt_with_retry(ctx, &envelope.compressed).await? {
            TransportOutcome::Delivered => Ok(PublishOutcome::Delivered),
            TransportOutcome::Terminal => Ok(PublishOutcome::Terminal),
            TransportOutcome::Transient => {
                self.buffer
                    .write(&envelope.compressed)
                    .await
                    .map_err(PublishError::BufferWrite)?;
                Ok(PublishOutcome::Buffered)
            }
        }
    }

    async fn attempt_with_retry(
        &self,
        ctx: &CancellationToken,
        payload: &[u8],
    ) -> Result<TransportOutcome, PublishError> {
        let mut last = TransportOutcome::Transient;
        for attempt in 0..=self.retry_count {
            if ctx.is_cancelled() {
                return Err(PublishError::Cancelled);
            }
            match self.transport.send(payload).await {
                Ok(outcome @ TransportOutcome::Delivered)
                | Ok(outcome @ TransportOutcome::Terminal) => return Ok(outcome),
                Ok(TransportOutcome::Transient) => {
                    last = TransportOutcome::Transient;
                    debug!(attempt, "transient publish failure, will retry");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "publish transport error");
                    last = TransportOutcome::Transient;
                }
            }
            if attempt < self.retry_count {
                tokio::select! {
                    _ = tokio::time::sleep(self.retry_delay) => {}
                    _ = ctx.cancelled() => return Err(PublishError::Cancelled),
                }
            }
        }
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_with(
        transport: Arc<dyn PublisherTransport>,
        dir: &std::path::Path,
        retries: u32,
    ) -> PublisherClient {
        PublisherClient::new(
            transport,
            EnvelopeBuffer::new(dir.to_path_buf(), Duration::from_secs(7200)),
            retries,
            Duration::from_millis(1),
        )
    }

    fn envelope(bytes: &[u8]) -> UploadEnvelope {
        UploadEnvelope {
            sensor_id: "sensor-1".to_string(),
            compressed: bytes.to_vec(),
        }
    }

    #[tokio::test]
    async fn reqwest_transport_maps_200_to_delivered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "ok", "status_code": 200, "message": "accepted"
            })))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(
            Url::parse(&server.uri()).unwrap(),
            "key".to_string(),
            410,
        );
        let outcome = transport.send(b"payload").await.unwrap();
        assert_eq!(outcome, TransportOutcome::Delivered);
    }

    #[tokio::test]
    async fn reqwest_transport_maps_terminal_status_code_to_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(410).set_body_json(serde_json::json!({
                "status": "revoked", "status_code": 410, "message": "api key revoked"
            })))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(
            Url::parse(&server.uri()).unwrap(),
            "key".to_string(),
            410,
        );
        let outcome = transport.send(b"payload").await.unwrap();
        assert_eq!(outcome, TransportOutcome::Terminal);
    }

    struct CountingTransport {
        outcomes: std::sync::Mutex<Vec<TransportOutcome>>,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl PublisherTransport for CountingTransport {
        async fn send(&self, _envelope: &[u8]) -> Result<TransportOutcome, String> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                Ok(TransportOutcome::Transient)
            } else {
                Ok(outcomes.remove(0))
            }
        }
    }

    #[tokio::test]
    async fn retries_on_transient_then_succeeds() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(CountingTransport {
            outcomes: std::sync::Mutex::new(vec![
                TransportOutcome::Transient,
                TransportOutcome::Delivered,
            ]),
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let client = client_with(transport.clone(), dir.path(), 3);
        let ctx = CancellationToken::new();

        let outcome = client.upload(&ctx, &envelope(b"data")).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Delivered);
        assert_eq!(transport.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausting_retries_buffers_the_envelope() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(CountingTransport {
            outcomes: std::sync::Mutex::new(vec![]),
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let client = client_with(transport.clone(), dir.path(), 2);
        let ctx = CancellationToken::new();

        let outcome = client.upload(&ctx, &envelope(b"data")).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Buffered);

        let mut count = 0;
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn terminal_outcome_short_circuits_without_buffering() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(CountingTransport {
            outcomes: std::sync::Mutex::new(vec![TransportOutcome::Terminal]),
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let client = client_with(transport, dir.path(), 3);
        let ctx = CancellationToken::new();

        let outcome = client.upload(&ctx, &envelope(b"data")).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Terminal);

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }
}
