/*!
Local filesystem object store.

Keys map to files under a store directory, which is expected to outlive the
process (a mounted volume, for example).
*/

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::ObjectStore;
use crate::{Result, ThawError};

/// Local filesystem object store
///
/// Parent directories are created on demand and each object is written to a
/// temporary sibling first, then renamed over the old one, so a crash mid-write
/// never leaves a half-written snapshot behind.
///
/// # Example
/// ```rust
/// use thaw_core::storage::{LocalObjectStore, ObjectStore};
///
/// let store = LocalObjectStore::new("/var/thaw/snapshots");
/// assert_eq!(store.describe(), "file:///var/thaw/snapshots");
/// ```
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    base_dir: PathBuf,
}

impl LocalObjectStore {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    /// Resolve the full path for a given key
    fn resolve_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(key.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let full_path = self.resolve_path(key);

        match fs::read(&full_path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ThawError::not_found(key)),
            Err(e) => Err(ThawError::storage(format!(
                "Failed to read snapshot from {}: {e}",
                full_path.display()
            ))),
        }
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let full_path = self.resolve_path(key);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                ThawError::storage(format!(
                    "Failed to create directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let tmp_path = full_path.with_extension("tmp");
        fs::write(&tmp_path, &data).await.map_err(|e| {
            ThawError::storage(format!(
                "Failed to write snapshot to {}: {e}",
                tmp_path.display()
            ))
        })?;
        fs::rename(&tmp_path, &full_path).await.map_err(|e| {
            ThawError::storage(format!(
                "Failed to move snapshot into place at {}: {e}",
                full_path.display()
            ))
        })?;

        Ok(())
    }

    fn describe(&self) -> String {
        format!("file://{}", self.base_dir.display())
    }
}
