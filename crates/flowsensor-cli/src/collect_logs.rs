//! Bundles the sensor's output/log directories into a single zip for
//! attaching to a support ticket. Not part of the capture/analyze/publish
//! pipeline itself.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::ZipWriter;

#[derive(Debug, Error)]
pub enum CollectLogsError {
    #[error("invalid or non-existent path: {0}")]
    InvalidPath(PathBuf),
    #[error("zip operation failed: {0}")]
    Zip(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn add_file_to_zip(
    zip: &mut ZipWriter<File>,
    file_path: &Path,
    relative_path: Option<&Path>,
    options: &FileOptions<()>,
) -> Result<(), CollectLogsError> {
    let mut file = File::open(file_path)?;
    let path = match relative_path {
        Some(relative_path) => relative_path.as_os_str(),
        None => file_path
            .file_name()
            .ok_or_else(|| CollectLogsError::InvalidPath(file_path.to_path_buf()))?,
    };
    zip.start_file(path.to_string_lossy().as_ref(), *options)
        .map_err(|e| CollectLogsError::Zip(e.to_string()))?;
    io::copy(&mut file, zip)?;
    Ok(())
}

/// Zips `dirs` (capture output dir, buffer dir, log dir) into `dest_zip`.
pub fn collect_logs(dirs: &[PathBuf], dest_zip: &Path) -> Result<(), CollectLogsError> {
    let out_file = File::create(dest_zip)?;
    let mut zip = ZipWriter::new(out_file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for dir in dirs {
        if dir.is_dir() {
            for entry in WalkDir::new(dir) {
                let entry = entry.map_err(|e| CollectLogsError::Zip(e.to_string()))?;
                let file_path = entry.path();
                if !file_path.is_file() {
                    continue;
                }
                let dir_name = dir
                    .file_name()
                    .ok_or_else(|| CollectLogsError::InvalidPath(dir.clone()))?;
                let relative_path = file_path
                    .strip_prefix(dir)
                    .map_err(|e| CollectLogsError::Zip(e.to_string()))?;
                let zip_path = PathBuf::from(dir_name).join(relative_path);
                add_file_to_zip(&mut zip, file_path, Some(&zip_path), &options)?;
            }
        } else if dir.is_file() {
            add_file_to_zip(&mut zip, dir, None, &options)?;
        } else {
            return Err(CollectLogsError::InvalidPath(dir.clone()));
        }
    }

    zip.finish().map_err(|e| CollectLogsError::Zip(e.to_string()))?;
    Ok(())
}
