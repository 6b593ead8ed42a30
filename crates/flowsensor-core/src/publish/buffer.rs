//! On-disk FIFO buffer for envelopes the publisher could not deliver.
//!
//! File names encode creation order (`buf_<UTC-compact>_<seq>.bin`), so a
//! lexicographic sort yields oldest-first without reading file metadata.
//! Grounded on the retention-threshold and drain-then-flush pattern in
//! `oddjobs`'s daemon lifecycle module.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client::{PublisherTransport, TransportOutcome};
use crate::model::PublishOutcome;

pub struct EnvelopeBuffer {
    dir: PathBuf,
    max_age: Duration,
}

impl EnvelopeBuffer {
    pub fn new(dir: PathBuf, max_age: Duration) -> Self {
        Self { dir, max_age }
    }

    /// Removes files older than `max_age` and returns the remaining ones,
    /// oldest first.
    async fn list_sorted_after_purge(&self) -> std::io::Result<Vec<PathBuf>> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                continue;
            }
            let metadata = entry.metadata().await?;
            if let Ok(age) = metadata
                .modified()
                .and_then(|m| m.elapsed().map_err(|e| std::io::Error::other(e.to_string())))
            {
                if age > self.max_age {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        warn!(path = %path.display(), error = %e, "failed to purge stale buffered envelope");
                    } else {
                        debug!(path = %path.display(), "purged stale buffered envelope");
                    }
                    continue;
                }
            }
            files.push(path);
        }
        files.sort();
        Ok(files)
    }

    /// Writes a new envelope into the buffer with a timestamp- and
    /// sequence-ordered file name.
    pub async fn write(&self, payload: &[u8]) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let seq = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("buf_{}_{}.bin", Utc::now().format("%Y%m%dT%H%M%S%.f"), &seq[..8]);
        let path = self.dir.join(name);
        tokio::fs::write(&path, payload).await?;
        Ok(path)
    }

    /// Flushes buffered envelopes oldest-first before the caller sends its
    /// current envelope. Stops at the first transient failure, leaving the
    /// remainder for the next cycle. Returns `Some(PublishOutcome::Terminal)`
    /// if the publisher reports the sensor is permanently revoked, in which
    /// case the caller should stop publishing altogether.
    pub async fn flush(
        &self,
        transport: &std::sync::Arc<dyn PublisherTransport>,
        ctx: &CancellationToken,
    ) -> Result<Option<PublishOutcome>, super::client::PublishError> {
        let files = self
            .list_sorted_after_purge()
            .await
            .map_err(super::client::PublishError::BufferWrite)?;

        for file in files {
            if ctx.is_cancelled() {
                return Err(super::client::PublishError::Cancelled);
            }
            let payload = match tokio::fs::read(&file).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(path = %file.display(), error = %e, "failed to read buffered envelope, skipping");
                    continue;
                }
            };
            match transport.send(&payload).await {
                Ok(TransportOutcome::Delivered) => {
                    let _ = tokio::fs::remove_file(&file).await;
                }
                Ok(TransportOutcome::Terminal) => {
                    return Ok(Some(PublishOutcome::Terminal));
                }
                Ok(TransportOutcome::Transient) | Err(_) => {
                    debug!(path = %file.display(), "publisher still unreachable, stopping flush for this cycle");
                    break;
                }
            }
        }
        Ok(None)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    struct AlwaysDelivers(AtomicUsize);
    #[async_trait]
    impl PublisherTransport for AlwaysDelivers {
        async fn send(&self, _envelope: &[u8]) -> Result<TransportOutcome, String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(TransportOutcome::Delivered)
        }
    }

    struct AlwaysTransient;
    #[async_trait]
    impl PublisherTransport for AlwaysTransient {
        async fn send(&self, _envelope: &[u8]) -> Result<TransportOutcome, String> {
            Ok(TransportOutcome::Transient)
        }
    }

    #[tokio::test]
    async fn flush_delivers_all_buffered_envelopes_oldest_first() {
        let dir = tempdir().unwrap();
        let buffer = EnvelopeBuffer::new(dir.path().to_path_buf(), Duration::from_secs(3600));
        buffer.write(b"one").await.unwrap();
        buffer.write(b"two").await.unwrap();

        let transport: Arc<dyn PublisherTransport> = Arc::new(AlwaysDelivers(AtomicUsize::new(0)));
        let ctx = CancellationToken::new();
        let outcome = buffer.flush(&transport, &ctx).await.unwrap();
        assert_eq!(outcome, None);
        assert!(tokio::fs::read_dir(dir.path())
            .await
            .unwrap()
            .next_entry()
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn flush_stops_at_first_transient_failure() {
        let dir = tempdir().unwrap();
        let buffer = EnvelopeBuffer::new(dir.path().to_path_buf(), Duration::from_secs(3600));
        buffer.write(b"one").await.unwrap();
        buffer.write(b"two").await.unwrap();

        let transport: Arc<dyn PublisherTransport> = Arc::new(AlwaysTransient);
        let ctx = CancellationToken::new();
        buffer.flush(&transport, &ctx).await.unwrap();

        let mut remaining = 0;
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while entries.next_entry().await.unwrap().is_some() {
            remaining += 1;
        }
        assert_eq!(remaining, 2, "both files should remain after a transient failure");
    }

    #[tokio::test]
    async fn purges_files_older_than_max_age() {
        let dir = tempdir().unwrap();
        let buffer = EnvelopeBuffer::new(dir.path().to_path_buf(), Duration::from_secs(0));
        let path = buffer.write(b"stale").await.unwrap();
        // max_age(0) means anything with nonzero elapsed time is purged.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let files = buffer.list_sorted_after_purge().await.unwrap();
        assert!(files.is_empty());
        assert!(tokio::fs::metadata(&path).await.is_err());
    }
}
