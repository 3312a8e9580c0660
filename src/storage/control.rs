//! Operator control inbox.
//!
//! `dayforge trigger <stage>` drops a request file into
//! `<state_dir>/control/`; the running orchestrator drains the directory on
//! a short poll interval and feeds each request into its event loop.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

use super::write_atomic;
use crate::pipeline::day::StageKind;

/// One queued operator request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFile {
    pub id: Uuid,
    pub stage: StageKind,
    pub requested_at: DateTime<Utc>,
}

/// Directory-backed queue of manual stage triggers.
#[derive(Debug, Clone)]
pub struct ControlInbox {
    dir: PathBuf,
}

impl ControlInbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Queues a trigger for `stage`.
    pub async fn submit(&self, stage: StageKind) -> std::io::Result<ControlFile> {
        let request = ControlFile {
            id: Uuid::new_v4(),
            stage,
            requested_at: Utc::now(),
        };
        // Timestamp prefix keeps requests in submission order.
        let name = format!(
            "{}-{}.json",
            request.requested_at.format("%Y%m%dT%H%M%S%.6f"),
            request.id
        );
        let json = serde_json::to_vec(&request).map_err(std::io::Error::other)?;
        write_atomic(&self.dir.join(name), &json).await?;
        Ok(request)
    }

    /// Takes every queued request, oldest first, removing the files.
    ///
    /// Malformed files are logged and removed.
    pub async fn drain(&self) -> std::io::Result<Vec<ControlFile>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut requests = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = fs::read(&path).await?;
            match serde_json::from_slice::<ControlFile>(&bytes) {
                Ok(request) => requests.push(request),
                Err(e) => warn!(path = %path.display(), error = %e, "Dropping malformed control request"),
            }
            fs::remove_file(&path).await?;
        }
        Ok(requests)
    }
}
