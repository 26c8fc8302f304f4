//! Flagged frames are kept for human review in one directory and evicted by age.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::broadcast, task::JoinHandle};

#[derive(Error, Debug)]
pub enum RetentionError {
    #[error("Failed to prepare review directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to retain frame {path:?}: {source}")]
    Move {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Frame path has no file name: {0:?}")]
    InvalidFrame(PathBuf),
    #[error("Failed to scan review directory: {0}")]
    Scan(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ReviewStore {
    dir: PathBuf,
    max_age: Duration,
}

impl ReviewStore {
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_age,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Moves `frame` into the review directory and returns its new location.
    pub async fn retain(&self, frame: &Path, request_id: &str) -> Result<PathBuf, RetentionError> {
        let file_name = frame
            .file_name()
            .ok_or_else(|| RetentionError::InvalidFrame(frame.to_path_buf()))?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| RetentionError::CreateDir {
                path: self.dir.clone(),
                source,
            })?;

        let target = self
            .dir
            .join(format!("{}_{}", request_id, file_name.to_string_lossy()));

        if tokio::fs::rename(frame, &target).await.is_err() {
            // rename fails across filesystems
            let moved = match tokio::fs::copy(frame, &target).await {
                Ok(_) => tokio::fs::remove_file(frame).await,
                Err(e) => Err(e),
            };
            moved.map_err(|source| RetentionError::Move {
                path: frame.to_path_buf(),
                source,
            })?;
        }

        Ok(target)
    }

    /// Drops frames retained by a request that did not finish.
    pub async fn release(&self, retained: &[PathBuf]) {
        for path in retained {
            if let Err(e) = tokio::fs::remove_file(path).await {
                tracing::warn!("Failed to release review frame {:?}: {}", path, e);
            }
        }
    }

    /// Deletes retained frames older than the configured maximum age.
    pub fn evict_expired(&self) -> Result<usize, RetentionError> {
        if !self.dir.exists() {
            return Ok(0);
        }

        let mut evicted = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }

            let expired = metadata
                .modified()
                .ok()
                .map(|modified| modified.elapsed().unwrap_or_default())
                .is_some_and(|age| age >= self.max_age);
            if !expired {
                continue;
            }

            match fs::remove_file(entry.path()) {
                Ok(()) => evicted += 1,
                Err(e) => tracing::warn!("Failed to evict {:?}: {}", entry.path(), e),
            }
        }

        Ok(evicted)
    }
}

pub struct RetentionSweeper {
    store: ReviewStore,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(store: ReviewStore, interval: Duration) -> Self {
        Self { store, interval }
    }

    pub fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let store = self.store.clone();
                        match tokio::task::spawn_blocking(move || store.evict_expired()).await {
                            Ok(Ok(0)) => {}
                            Ok(Ok(evicted)) => {
                                tracing::info!("Evicted {} expired review frames", evicted);
                            }
                            Ok(Err(e)) => tracing::error!("Review sweep failed: {}", e),
                            Err(e) => tracing::error!("Review sweep task failed: {}", e),
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Retention sweeper received shutdown signal");
                        break;
                    }
                }
            }
            tracing::info!("Retention sweeper stopped");
        })
    }
}
