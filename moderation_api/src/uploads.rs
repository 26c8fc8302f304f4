//! Per-request scratch files. Everything created here is removed when dropped.

use bytes::Bytes;
use rand::{distr::Alphanumeric, Rng};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::{Builder as TempFileBuilder, NamedTempFile, TempDir};
use thiserror::Error;

const FALLBACK_EXTENSION: &str = "bin";
const MAX_EXTENSION_LEN: usize = 8;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Failed to prepare directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to store upload: {0}")]
    Write(#[from] std::io::Error),
    #[error("Upload task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub fn ensure_dir(path: &Path) -> Result<(), UploadError> {
    std::fs::create_dir_all(path).map_err(|source| UploadError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

/// Short random identifier used to name per-request artifacts.
pub fn new_request_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

/// Keeps the client's extension so decoders can pick a format, but never its name.
fn extension_of(file_name: Option<&str>) -> String {
    file_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| {
            !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_else(|| FALLBACK_EXTENSION.to_string())
}

/// Writes an uploaded asset to a uniquely named file in `dir`.
pub async fn persist(
    dir: &Path,
    prefix: &str,
    file_name: Option<&str>,
    data: Bytes,
) -> Result<NamedTempFile, UploadError> {
    let dir = dir.to_path_buf();
    let prefix = format!("{}_", prefix);
    let suffix = format!(".{}", extension_of(file_name));

    tokio::task::spawn_blocking(move || -> Result<NamedTempFile, UploadError> {
        ensure_dir(&dir)?;
        let mut file = TempFileBuilder::new()
            .prefix(&prefix)
            .suffix(&suffix)
            .tempfile_in(&dir)?;
        file.write_all(&data)?;
        file.flush()?;
        tracing::debug!("Stored {} bytes at {:?}", data.len(), file.path());
        Ok(file)
    })
    .await?
}

/// Directory holding the sampled frames of one video request.
pub fn frame_workspace(frames_dir: &Path, request_id: &str) -> Result<TempDir, UploadError> {
    ensure_dir(frames_dir)?;
    Ok(TempFileBuilder::new()
        .prefix(&format!("{}_", request_id))
        .tempdir_in(frames_dir)?)
}
