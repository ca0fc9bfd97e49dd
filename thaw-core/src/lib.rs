/*!
# Thaw Core

Write-back durability layer for ephemeral compute.

Serverless instances lose their local filesystem between cold starts. This crate
watches a scratch directory, stages changed file content in memory, and once the
directory has been quiet for a debounce interval uploads everything staged as one
compressed tar snapshot under a fixed object key. On the next cold start the same
snapshot is fetched and unpacked before any new writes are observed.

## Architecture

- [`StagingBuffer`]: path → latest content map shared by the watcher and flushes
- [`FlushScheduler`]: sliding-window debounce with a single outstanding timer
- [`ChangeWatcher`]: turns notifier events into staged content
- [`SnapshotCodec`]: archive entries ⇄ compressed blob
- [`SnapshotStore`]: restore on start, drain/encode/upload on flush
- [`ObjectStore`](storage::ObjectStore): S3, local directory or in-memory backend
- [`ThawDaemon`]: owns all of the above for one execution identity

## Usage

```rust,no_run
use thaw_core::storage::create_store;
use thaw_core::{ThawConfig, ThawDaemon};
use tokio_util::sync::CancellationToken;

# async fn run() -> thaw_core::Result<()> {
let config = ThawConfig::s3("my-cache-bucket", "my-function").with_key_prefix("warm");
let store = create_store(&config).await?;
let daemon = ThawDaemon::new(config, store)?;

let shutdown = CancellationToken::new();
daemon.run(shutdown).await?;
# Ok(())
# }
```
*/

pub mod archive;
pub mod compression;
pub mod config;
pub mod daemon;
pub mod error;
pub mod observability;
pub mod scheduler;
pub mod snapshot;
pub mod staging;
pub mod storage;
pub mod watcher;

pub use archive::{ArchiveEntry, EntryKind, SnapshotCodec};
pub use compression::{CompressionAdapter, CompressionAlgorithm, GzipCompressor, ZstdCompressor};
pub use config::{FlushFailurePolicy, StorageBackend, ThawConfig};
pub use daemon::ThawDaemon;
pub use error::{Result, ThawError};
pub use scheduler::{FlushScheduler, FlushTarget, SchedulerState};
pub use snapshot::{FlushReport, RestoreReport, SnapshotStore};
pub use staging::StagingBuffer;
pub use watcher::{ChangeWatcher, DirectoryWatch, NotifyWatch};

pub use observability::{init_default_observability, init_observability, LogFormat};
#[cfg(feature = "metrics")]
pub use observability::ThawMetrics;
