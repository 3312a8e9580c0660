//! Archive of past pipeline days.
//!
//! Days are archived (never deleted) at rollover, in whatever state they
//! reached. Old archives are pruned after the retention period.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use super::write_atomic;
use crate::pipeline::day::PipelineDay;

/// Errors that can occur while reading or writing the archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode archived day: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Archived day {path} is unreadable: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("No archived day for {0}")]
    NotFound(NaiveDate),
}

/// Directory of `<date>.json` files, one per archived day.
#[derive(Debug, Clone)]
pub struct DayArchive {
    dir: PathBuf,
}

impl DayArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.json", date.format("%Y-%m-%d")))
    }

    /// Stores `day`, replacing any earlier archive for the same date.
    pub async fn archive(&self, day: &PipelineDay) -> Result<PathBuf, ArchiveError> {
        let path = self.path_for(day.date);
        let json = serde_json::to_vec_pretty(day)?;
        write_atomic(&path, &json)
            .await
            .map_err(|source| ArchiveError::Io {
                path: path.clone(),
                source,
            })?;
        info!(date = %day.date, stage = %day.stage, path = %path.display(), "Archived pipeline day");
        Ok(path)
    }

    /// Loads the archived day for `date`.
    pub async fn load(&self, date: NaiveDate) -> Result<PipelineDay, ArchiveError> {
        let path = self.path_for(date);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| ArchiveError::Corrupt {
                path,
                message: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ArchiveError::NotFound(date)),
            Err(source) => Err(ArchiveError::Io { path, source }),
        }
    }

    /// Archived dates, oldest first.
    pub async fn dates(&self) -> Result<Vec<NaiveDate>, ArchiveError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ArchiveError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut dates = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| ArchiveError::Io {
            path: self.dir.clone(),
            source,
        })? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            match NaiveDate::parse_from_str(stem, "%Y-%m-%d") {
                Ok(date) => dates.push(date),
                Err(_) => debug!(file = stem, "Skipping non-archive file"),
            }
        }
        dates.sort();
        Ok(dates)
    }

    /// All archived days, oldest first. Unreadable files are skipped.
    pub async fn list(&self) -> Result<Vec<PipelineDay>, ArchiveError> {
        let mut days = Vec::new();
        for date in self.dates().await? {
            match self.load(date).await {
                Ok(day) => days.push(day),
                Err(e) => warn!(%date, error = %e, "Skipping unreadable archived day"),
            }
        }
        Ok(days)
    }

    /// Deletes archives dated before `cutoff`. Returns how many were removed.
    pub async fn prune_before(&self, cutoff: NaiveDate) -> Result<usize, ArchiveError> {
        let mut removed = 0;
        for date in self.dates().await? {
            if date >= cutoff {
                break;
            }
            let path = self.path_for(date);
            fs::remove_file(&path)
                .await
                .map_err(|source| ArchiveError::Io { path, source })?;
            removed += 1;
        }
        if removed > 0 {
            info!(removed, %cutoff, "Pruned archived days");
        }
        Ok(removed)
    }
}
