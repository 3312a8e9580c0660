//! File-based state outside the live checkpoint.
//!
//! - **Archive**: one JSON file per finished (or abandoned) pipeline day
//! - **Control**: the operator inbox that `dayforge trigger` writes to and
//!   the running event loop polls
//!
//! Everything lives under the configured `state_dir`:
//!
//! ```text
//! state/
//! ├── checkpoint.json
//! ├── metrics.prom
//! ├── archive/2024-07-05.json
//! └── control/<request>.json
//! ```

pub mod archive;
pub mod control;

use std::path::Path;

use tokio::fs;
use tokio::io::AsyncWriteExt;

pub use archive::{ArchiveError, DayArchive};
pub use control::{ControlFile, ControlInbox};

/// Replaces `path` with `contents` so readers see either the old or the new
/// file, never a partial one: write a sibling temp file, fsync, rename.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = std::path::PathBuf::from(temp);

    let mut file = fs::File::create(&temp).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&temp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_atomic_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");

        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();

        assert_eq!(fs::read_to_string(&path).await.unwrap(), "second");
        assert!(!dir.path().join("nested").join("state.json.tmp").exists());
    }
}
