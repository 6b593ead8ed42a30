//! Logging setup: a console layer plus an optional rotating file layer.
//!
//! The rotating writer is a hand-rolled `Write` + `MakeWriter` pair, the
//! same idiom used for the in-memory log buffer in the iggy-rs server's
//! logger module, generalized here from an in-memory `Vec<String>` sink to
//! a size-rotating file sink.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

struct RotatingFile {
    path: PathBuf,
    file: File,
    written: u64,
    max_bytes: u64,
    max_backups: u32,
}

impl RotatingFile {
    fn open(path: PathBuf, max_bytes: u64, max_backups: u32) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            written,
            max_bytes,
            max_backups,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        for i in (1..self.max_backups).rev() {
            let from = backup_path(&self.path, i);
            let to = backup_path(&self.path, i + 1);
            if from.exists() {
                let _ = std::fs::rename(&from, &to);
            }
        }
        if self.max_backups > 0 {
            let _ = std::fs::rename(&self.path, backup_path(&self.path, 1));
        }
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

fn backup_path(base: &Path, index: u32) -> PathBuf {
    let mut name = base.file_name().and_then(|n| n.to_str()).unwrap_or("flowsensor.log").to_string();
    name.push_str(&format!(".{index}"));
    base.with_file_name(name)
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.max_bytes > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[derive(Clone)]
struct RotatingFileMakeWriter(Arc<Mutex<RotatingFile>>);

struct RotatingFileGuard(Arc<Mutex<RotatingFile>>);

impl Write for RotatingFileGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingFileMakeWriter {
    type Writer = RotatingFileGuard;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingFileGuard(self.0.clone())
    }
}

/// Deletes log files (the active file and its numbered backups) under the
/// configured log directory that have not been touched in
/// `log_retention_days`.
async fn purge_expired_logs(file: &Path, retention_days: u64) {
    let Some(dir) = file.parent() else { return };
    let Some(stem) = file.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    let max_age = std::time::Duration::from_secs(retention_days * 24 * 3600);
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(stem) {
            continue;
        }
        if let Ok(metadata) = entry.metadata().await {
            if let Ok(modified) = metadata.modified() {
                if modified.elapsed().map(|e| e > max_age).unwrap_or(false) {
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
        }
    }
}

fn level_filter_for(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

/// `-v`/`-vv`/`-vvv` raises the effective level regardless of
/// `logging.level`; `None` (zero flags) leaves the configured level alone.
fn verbose_override(verbose: u8) -> Option<LevelFilter> {
    match verbose {
        0 => None,
        1 => Some(LevelFilter::DEBUG),
        _ => Some(LevelFilter::TRACE),
    }
}

/// Initializes the global `tracing` subscriber: stdout always, plus a
/// rotating file writer when `logging.file` is configured. `verbose` is the
/// CLI's `-v` repeat count, which overrides `config.level` when nonzero.
/// Returns nothing to keep alive (unlike `tracing-appender`'s `WorkerGuard`)
/// because the rotating writer flushes synchronously on every write.
pub async fn init(config: &LoggingConfig, verbose: u8) -> anyhow::Result<()> {
    let level = verbose_override(verbose).unwrap_or_else(|| level_filter_for(&config.level));
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .parse_lossy(format!("flowsensor={level}"));

    let registry = tracing_subscriber::registry().with(fmt::layer()).with(env_filter);

    if let Some(path) = &config.file {
        purge_expired_logs(path, config.log_retention_days).await;
        let rotating = RotatingFile::open(
            path.clone(),
            config.max_size_mb * 1024 * 1024,
            config.max_backups,
        )?;
        let writer = RotatingFileMakeWriter(Arc::new(Mutex::new(rotating)));
        registry
            .with(fmt::layer().with_ansi(false).with_writer(writer))
            .init();
    } else {
        registry.init();
    }

    Ok(())
}
