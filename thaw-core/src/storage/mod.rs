/*!
Object store adapters for snapshot persistence.

This module defines the storage abstraction (port) and concrete implementations
(adapters). The snapshot pipeline only ever reads one key on startup and overwrites
the same key on every flush, so the port is just `get` and `put`.
*/

pub mod local;
pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{StorageBackend, ThawConfig};
use crate::{Result, ThawError};

/// Remote object store abstraction
///
/// Implementations must report a missing object as [`ThawError::NotFound`] so that
/// a cold start with no prior snapshot can be told apart from a real failure.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the full object stored under `key`
    ///
    /// # Errors
    /// * `ThawError::NotFound` - No object exists under `key`
    /// * `ThawError::Storage` - Any other backend failure
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Replace the object under `key` with `data`
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;

    /// Human readable location used in log lines, e.g. `s3://bucket`
    fn describe(&self) -> String;
}

// Re-export types for convenience
pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;

/// Build the object store selected by `config`
///
/// Failures here are startup failures: credentials that cannot be resolved or a
/// backend that was not compiled in.
pub async fn create_store(config: &ThawConfig) -> Result<Arc<dyn ObjectStore>> {
    config.validate()?;

    match config.backend {
        StorageBackend::S3 => create_s3_store(config).await,
        StorageBackend::Local => {
            let dir = config
                .local_store_dir
                .clone()
                .ok_or_else(|| ThawError::validation("Local backend requires a store directory"))?;
            Ok(Arc::new(LocalObjectStore::new(dir)))
        }
        StorageBackend::Memory => Ok(Arc::new(MemoryObjectStore::new())),
    }
}

#[cfg(feature = "s3")]
async fn create_s3_store(config: &ThawConfig) -> Result<Arc<dyn ObjectStore>> {
    let bucket = config
        .s3_bucket
        .clone()
        .ok_or_else(|| ThawError::validation("S3 backend requires a valid bucket name"))?;
    let store = S3ObjectStore::connect(
        bucket,
        config.s3_region.clone(),
        config.s3_endpoint.clone(),
    )
    .await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "s3"))]
async fn create_s3_store(_config: &ThawConfig) -> Result<Arc<dyn ObjectStore>> {
    Err(ThawError::storage(
        "S3 support was not compiled in (enable the `s3` feature)",
    ))
}
