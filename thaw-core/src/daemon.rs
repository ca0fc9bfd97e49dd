/*!
Process-lifetime wiring.

[`ThawDaemon`] owns the staging buffer, the debounce scheduler and the snapshot
store for one execution identity. Startup order is fixed: restore first, then
register watches, then consume change events until shutdown, then one last flush.
*/

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ThawConfig;
use crate::scheduler::{FlushScheduler, FlushTarget, SchedulerState};
use crate::snapshot::{FlushReport, RestoreReport, SnapshotStore};
use crate::staging::StagingBuffer;
use crate::storage::ObjectStore;
use crate::watcher::{ChangeWatcher, DirectoryWatch, NotifyWatch, WatchMessage};
use crate::Result;

/// The write-back cache for one base directory
pub struct ThawDaemon {
    config: ThawConfig,
    buffer: Arc<StagingBuffer>,
    snapshots: Arc<SnapshotStore>,
    scheduler: FlushScheduler,
}

impl ThawDaemon {
    /// Build the daemon around an already constructed object store
    ///
    /// # Errors
    /// Returns `ThawError::Validation` when the configuration is unusable.
    pub fn new(config: ThawConfig, store: Arc<dyn ObjectStore>) -> Result<Self> {
        config.validate()?;

        let buffer = Arc::new(StagingBuffer::new());
        let snapshots = Arc::new(SnapshotStore::new(&config, store, buffer.clone()));
        let target: Arc<dyn FlushTarget> = snapshots.clone();
        let scheduler = FlushScheduler::new(config.flush_interval, target);

        Ok(Self {
            config,
            buffer,
            snapshots,
            scheduler,
        })
    }

    pub fn config(&self) -> &ThawConfig {
        &self.config
    }

    pub fn base_path(&self) -> &Path {
        &self.config.base_path
    }

    pub fn buffer(&self) -> &Arc<StagingBuffer> {
        &self.buffer
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    /// Restore the remote snapshot into the base path
    ///
    /// A missing snapshot or any fetch, decode or write failure is logged and
    /// swallowed; the process carries on with whatever is on disk.
    pub async fn restore(&self) -> Option<RestoreReport> {
        match self.snapshots.restore().await {
            Ok(report) => Some(report),
            Err(e) => {
                #[cfg(feature = "metrics")]
                crate::observability::record(|m| m.restore_failures_total.inc());
                if e.is_not_found() {
                    warn!(key = %self.snapshots.key(), "No snapshot to restore, starting cold");
                } else {
                    warn!(key = %self.snapshots.key(), error = %e, "Snapshot restore failed, starting cold");
                }
                None
            }
        }
    }

    /// Run with the platform notifier until `shutdown` is cancelled
    ///
    /// # Errors
    /// Fails only when the notifier cannot be created.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let (watch, events) = NotifyWatch::new()?;
        self.run_with(watch, events, shutdown).await
    }

    /// Run with a caller-supplied watch registration and event stream
    pub async fn run_with<W: DirectoryWatch>(
        &self,
        mut watch: W,
        events: UnboundedReceiver<WatchMessage>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let base = self.config.base_path.clone();
        info!(
            base = %base.display(),
            key = %self.snapshots.key(),
            interval_ms = self.config.flush_interval.as_millis() as u64,
            "Starting thaw daemon"
        );

        self.restore().await;
        tokio::fs::create_dir_all(&base).await?;

        let watcher = ChangeWatcher::new(base, self.buffer.clone(), self.scheduler.clone());
        let registered = watcher.register_tree(&mut watch);
        info!(directories = registered, "Watching base directory");

        watcher.run(watch, events, shutdown).await;
        self.shutdown().await;
        Ok(())
    }

    /// Disarm the debounce timer and flush whatever is still staged
    pub async fn shutdown(&self) -> Option<FlushReport> {
        let was_pending = self.scheduler.cancel();
        info!(pending = was_pending, staged = self.buffer.len(), "Shutting down, running final flush");
        self.snapshots.flush().await.ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;
    use crate::ThawError;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct NullWatch;

    impl DirectoryWatch for NullWatch {
        fn watch_dir(&mut self, _dir: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn daemon_at(base: &Path, remote: Arc<MemoryObjectStore>) -> ThawDaemon {
        let config = ThawConfig::memory("fn")
            .with_base_path(base)
            .with_flush_interval(Duration::from_secs(3600));
        ThawDaemon::new(config, remote).unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = ThawConfig::memory("").with_base_path("/tmp/thaw");
        let result = ThawDaemon::new(config, Arc::new(MemoryObjectStore::new()));
        assert!(matches!(result, Err(ThawError::Validation(_))));
    }

    #[tokio::test]
    async fn test_restore_swallows_missing_snapshot() {
        let base = TempDir::new().unwrap();
        let daemon = daemon_at(base.path(), Arc::new(MemoryObjectStore::new()));
        assert_eq!(daemon.restore().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_staged_changes() {
        let base = TempDir::new().unwrap();
        let remote = Arc::new(MemoryObjectStore::new());
        let daemon = daemon_at(base.path(), remote.clone());

        daemon.buffer().put(base.path().join("late.txt"), b"z".to_vec());
        let report = daemon.shutdown().await.unwrap();

        assert_eq!(report.files, 1);
        assert_eq!(remote.put_count(), 1);
        assert!(daemon.shutdown().await.is_none());
    }

    #[tokio::test]
    async fn test_run_with_restores_before_watching() {
        let remote = Arc::new(MemoryObjectStore::new());
        let seed = TempDir::new().unwrap();
        let seeder = daemon_at(seed.path(), remote.clone());
        seeder.buffer().put(seed.path().join("sub/x.txt"), b"hello".to_vec());
        seeder.shutdown().await.unwrap();

        let base = TempDir::new().unwrap();
        let daemon = daemon_at(base.path(), remote.clone());
        let (_tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        daemon
            .run_with(NullWatch, rx, shutdown)
            .await
            .unwrap();

        assert_eq!(std::fs::read(base.path().join("sub/x.txt")).unwrap(), b"hello");
        // Restored files are not staged again, so the final flush had nothing to do.
        assert_eq!(remote.put_count(), 1);
        assert_eq!(daemon.scheduler_state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_run_with_creates_missing_base() {
        let parent = TempDir::new().unwrap();
        let base = parent.path().join("not-yet");
        let daemon = daemon_at(&base, Arc::new(MemoryObjectStore::new()));

        let (_tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        daemon
            .run_with(NullWatch, rx, shutdown)
            .await
            .unwrap();

        assert!(base.is_dir());
    }
}
