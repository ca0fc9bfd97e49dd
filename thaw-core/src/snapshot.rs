/*!
Snapshot store: restore on start, flush on trigger.

Ties the staging buffer, the snapshot codec and the object store together. A flush
drains the buffer, archives the drained content relative to the base path and
overwrites the single remote key. A restore fetches that key and materializes its
entries under the base path.
*/

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::archive::{entries_from_staged, ArchiveEntry, EntryKind, SnapshotCodec};
use crate::compression::CompressionAlgorithm;
use crate::config::{FlushFailurePolicy, ThawConfig};
use crate::scheduler::FlushTarget;
use crate::staging::StagingBuffer;
use crate::storage::ObjectStore;
use crate::{Result, ThawError};

/// What a restore wrote to disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub files: usize,
    /// Directories created; ones that already existed are not counted
    pub directories: usize,
    pub bytes: u64,
}

/// What a successful flush uploaded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub files: usize,
    pub directories: usize,
    pub archive_bytes: usize,
}

/// Restore and flush orchestration for one execution identity
///
/// # Example
/// ```rust
/// use std::sync::Arc;
/// use thaw_core::storage::MemoryObjectStore;
/// use thaw_core::{SnapshotStore, StagingBuffer, ThawConfig};
///
/// # async fn run() -> thaw_core::Result<()> {
/// let config = ThawConfig::memory("my-function").with_base_path("/tmp/cache");
/// let buffer = Arc::new(StagingBuffer::new());
/// let store = SnapshotStore::new(&config, Arc::new(MemoryObjectStore::new()), buffer.clone());
///
/// buffer.put("/tmp/cache/state.json".into(), b"{}".to_vec());
/// let report = store.flush().await?.expect("buffer was not empty");
/// assert_eq!(report.files, 1);
/// # Ok(())
/// # }
/// ```
pub struct SnapshotStore {
    base_path: PathBuf,
    key: String,
    compression: CompressionAlgorithm,
    failure_policy: FlushFailurePolicy,
    store: Arc<dyn ObjectStore>,
    buffer: Arc<StagingBuffer>,
    /// Held across drain, encode and upload
    flush_gate: AsyncMutex<()>,
}

impl SnapshotStore {
    pub fn new(config: &ThawConfig, store: Arc<dyn ObjectStore>, buffer: Arc<StagingBuffer>) -> Self {
        Self {
            base_path: config.base_path.clone(),
            key: config.remote_key(),
            compression: config.compression,
            failure_policy: config.on_flush_failure,
            store,
            buffer,
            flush_gate: AsyncMutex::new(()),
        }
    }

    /// The remote key this store reads and overwrites
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn buffer(&self) -> &Arc<StagingBuffer> {
        &self.buffer
    }

    fn codec(&self) -> SnapshotCodec {
        SnapshotCodec::new(self.compression.adapter())
    }

    /// Fetch and decode the remote snapshot without touching the filesystem
    ///
    /// # Errors
    /// * `ThawError::NotFound` - No snapshot has been uploaded yet
    /// * `ThawError::CorruptArchive` - The object could not be decoded
    /// * `ThawError::Storage` - The fetch itself failed
    pub async fn fetch(&self) -> Result<Vec<ArchiveEntry>> {
        let blob = self.store.get(&self.key).await?;
        debug!(key = %self.key, size = blob.len(), "Fetched snapshot");

        let codec = self.codec();
        tokio::task::spawn_blocking(move || codec.decode(&blob))
            .await
            .map_err(|e| ThawError::compression(format!("Snapshot decode task failed: {e}")))?
    }

    /// Fetch the remote snapshot and materialize it under the base path
    ///
    /// Nothing is written unless the whole snapshot decoded. Existing files are
    /// overwritten; existing directories keep their mode.
    pub async fn restore(&self) -> Result<RestoreReport> {
        let entries = self.fetch().await?;
        let report = self.materialize(entries).await?;

        #[cfg(feature = "metrics")]
        crate::observability::record(|m| m.restores_total.inc());
        info!(
            key = %self.key,
            base = %self.base_path.display(),
            files = report.files,
            directories = report.directories,
            bytes = report.bytes,
            "Restored snapshot"
        );
        Ok(report)
    }

    async fn materialize(&self, entries: Vec<ArchiveEntry>) -> Result<RestoreReport> {
        let mut report = RestoreReport::default();

        for entry in entries {
            let target = self.base_path.join(&entry.path);
            match entry.kind {
                EntryKind::Directory => {
                    if is_dir(&target).await {
                        continue;
                    }
                    create_dir_with_mode(&target, entry.mode).await?;
                    report.directories += 1;
                }
                EntryKind::File => {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent).await?;
                    }
                    fs::write(&target, &entry.content).await?;
                    report.files += 1;
                    report.bytes += entry.size();
                }
            }
        }

        Ok(report)
    }

    /// Upload everything staged so far as a new snapshot
    ///
    /// Returns `Ok(None)` without touching the network when the buffer is empty or
    /// holds nothing under the base path.
    /// On failure the drained entries are dropped or requeued according to the
    /// configured [`FlushFailurePolicy`].
    pub async fn flush(&self) -> Result<Option<FlushReport>> {
        let _gate = self.flush_gate.lock().await;

        let Some(drained) = self.buffer.drain_if_non_empty() else {
            return Ok(None);
        };
        let retained =
            (self.failure_policy == FlushFailurePolicy::Requeue).then(|| drained.clone());

        #[cfg(feature = "metrics")]
        let timer = crate::observability::FlushTimer::start();

        match self.upload(drained).await {
            Ok(None) => {
                debug!(key = %self.key, "Nothing under the base directory, skipping upload");
                Ok(None)
            }
            Ok(Some(report)) => {
                #[cfg(feature = "metrics")]
                timer.finish(report.archive_bytes);
                info!(
                    key = %self.key,
                    files = report.files,
                    directories = report.directories,
                    size = report.archive_bytes,
                    "Flushed snapshot"
                );
                Ok(Some(report))
            }
            Err(e) => {
                #[cfg(feature = "metrics")]
                timer.finish_with_error();
                match retained {
                    Some(entries) => {
                        let requeued = self.buffer.requeue(entries);
                        error!(key = %self.key, error = %e, requeued, "Snapshot flush failed, entries requeued");
                    }
                    None => {
                        error!(key = %self.key, error = %e, "Snapshot flush failed, staged changes dropped");
                    }
                }
                Err(e)
            }
        }
    }

    async fn upload(&self, drained: crate::staging::StagedEntries) -> Result<Option<FlushReport>> {
        let (entries, skipped) = entries_from_staged(&self.base_path, drained);
        for path in &skipped {
            warn!(path = %path.display(), base = %self.base_path.display(), "Skipping path outside the base directory");
        }

        // An empty archive would replace the remote snapshot with nothing.
        if entries.is_empty() {
            return Ok(None);
        }

        let directories = entries.iter().filter(|entry| entry.is_dir()).count();
        let files = entries.len() - directories;

        let codec = self.codec();
        let blob = tokio::task::spawn_blocking(move || codec.encode(&entries))
            .await
            .map_err(|e| ThawError::compression(format!("Snapshot encode task failed: {e}")))??;
        let archive_bytes = blob.len();

        self.store.put(&self.key, blob).await?;

        Ok(Some(FlushReport {
            files,
            directories,
            archive_bytes,
        }))
    }
}

#[async_trait]
impl FlushTarget for SnapshotStore {
    async fn flush_due(&self) {
        // Outcome already logged by `flush`.
        let _ = self.flush().await;
    }
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|metadata| metadata.is_dir())
        .unwrap_or(false)
}

async fn create_dir_with_mode(path: &Path, mode: u32) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(mode);
    #[cfg(not(unix))]
    let _ = mode;
    builder.create(path).await?;
    Ok(())
}
