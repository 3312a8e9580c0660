//! Durable checkpoint of the current day.
//!
//! One record, fully overwritten on every save (temp file, fsync, rename).
//! The previous good record is kept, written the same way, as
//! `checkpoint.prev.json` and used when the main file cannot be parsed.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use super::crash::CrashCounters;
use crate::pipeline::day::PipelineDay;
use crate::storage::write_atomic;

/// Errors raised by checkpoint persistence. Always fatal for the process.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Checkpoint {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },

    /// Any other store failure.
    #[error("Checkpoint store failed: {0}")]
    Store(String),
}

/// Everything needed to resume after a crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(flatten)]
    pub day: PipelineDay,
    #[serde(flatten)]
    pub crash: CrashCounters,
    pub checkpointed_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(day: PipelineDay, crash: CrashCounters) -> Self {
        Self {
            day,
            crash,
            checkpointed_at: Utc::now(),
        }
    }
}

/// Durable storage for the single live checkpoint.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Returns the stored checkpoint, or `None` if none was ever written.
    async fn load(&self) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Replaces the stored checkpoint.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;
}

/// JSON checkpoint on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
    backup_path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let backup_path = path.with_extension("prev.json");
        Self { path, backup_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self, path: &Path) -> Result<Option<Checkpoint>, CheckpointError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CheckpointError::Corrupt {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
    }
}

impl FileCheckpointStore {
    /// Replaces the backup with the current record, atomically. A current
    /// record that does not parse leaves the existing backup in place.
    async fn rotate_backup(&self) -> Result<(), CheckpointError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if let Err(e) = serde_json::from_slice::<Checkpoint>(&bytes) {
            warn!(
                path = %self.path.display(),
                error = %e,
                "Current checkpoint is corrupt, keeping previous backup"
            );
            return Ok(());
        }

        write_atomic(&self.backup_path, &bytes)
            .await
            .map_err(|source| CheckpointError::Io {
                path: self.backup_path.clone(),
                source,
            })
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        match self.read(&self.path).await {
            Err(CheckpointError::Corrupt { path, message }) => {
                warn!(path = %path.display(), error = %message, "Checkpoint corrupt, trying backup");
                match self.read(&self.backup_path).await {
                    Ok(Some(checkpoint)) => Ok(Some(checkpoint)),
                    _ => Err(CheckpointError::Corrupt { path, message }),
                }
            }
            other => other,
        }
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let json = serde_json::to_vec_pretty(checkpoint)?;

        self.rotate_backup().await?;

        write_atomic(&self.path, &json)
            .await
            .map_err(|source| CheckpointError::Io {
                path: self.path.clone(),
                source,
            })?;

        debug!(
            date = %checkpoint.day.date,
            stage = %checkpoint.day.stage,
            "Checkpoint saved"
        );
        Ok(())
    }
}
