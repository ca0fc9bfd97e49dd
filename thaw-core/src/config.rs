//! Configuration for the write-back cache
//!
//! Everything the daemon needs to know at startup: where the remote snapshot lives,
//! which local directory it mirrors, how long the debounce window is, and what to do
//! with drained entries when an upload fails.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::compression::CompressionAlgorithm;

/// Scratch directory mirrored when no base path is configured
pub const DEFAULT_BASE_PATH: &str = "/tmp";

/// Quiet period before a burst of writes is flushed
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Enumeration of supported object store backends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Amazon S3 (or an S3-compatible endpoint)
    #[default]
    S3,
    /// A directory on a durable local or mounted filesystem
    Local,
    /// In-process only; nothing survives the process
    Memory,
}

impl std::str::FromStr for StorageBackend {
    type Err = crate::ThawError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "s3" => Ok(StorageBackend::S3),
            "local" | "disk" => Ok(StorageBackend::Local),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(crate::ThawError::validation(format!(
                "Unknown storage backend '{other}' (expected s3, local or memory)"
            ))),
        }
    }
}

/// What happens to drained entries when the upload of their snapshot fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushFailurePolicy {
    /// Drop them; the next successful flush only carries later writes.
    #[default]
    Discard,
    /// Merge them back into the staging buffer unless a newer write replaced them.
    Requeue,
}

impl std::str::FromStr for FlushFailurePolicy {
    type Err = crate::ThawError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "discard" => Ok(FlushFailurePolicy::Discard),
            "requeue" => Ok(FlushFailurePolicy::Requeue),
            other => Err(crate::ThawError::validation(format!(
                "Unknown flush failure policy '{other}' (expected discard or requeue)"
            ))),
        }
    }
}

/// Runtime configuration for a cache instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThawConfig {
    /// Object store backend
    pub backend: StorageBackend,
    /// S3 bucket name (required for the S3 backend)
    pub s3_bucket: Option<String>,
    /// AWS region override (defaults to the environment)
    pub s3_region: Option<String>,
    /// Custom S3 endpoint, e.g. LocalStack or MinIO
    pub s3_endpoint: Option<String>,
    /// Directory holding snapshots for the local backend
    pub local_store_dir: Option<PathBuf>,
    /// Prefix of the remote key
    pub key_prefix: String,
    /// Execution identity; one remote object per identity
    pub identity: String,
    /// Local directory tree that is watched and restored
    pub base_path: PathBuf,
    /// Debounce window
    pub flush_interval: Duration,
    /// Compression frame around the archive
    pub compression: CompressionAlgorithm,
    /// Behaviour after a failed upload
    pub on_flush_failure: FlushFailurePolicy,
}

impl ThawConfig {
    /// Create a configuration with defaults for everything except the identity
    pub fn new<S: Into<String>>(identity: S) -> Self {
        ThawConfig {
            backend: StorageBackend::default(),
            s3_bucket: None,
            s3_region: None,
            s3_endpoint: None,
            local_store_dir: None,
            key_prefix: String::new(),
            identity: identity.into(),
            base_path: PathBuf::from(DEFAULT_BASE_PATH),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            compression: CompressionAlgorithm::default(),
            on_flush_failure: FlushFailurePolicy::default(),
        }
    }

    /// S3 configuration for the given bucket and identity
    pub fn s3<B: Into<String>, S: Into<String>>(bucket: B, identity: S) -> Self {
        ThawConfig {
            backend: StorageBackend::S3,
            s3_bucket: Some(bucket.into()),
            ..Self::new(identity)
        }
    }

    /// Local-directory configuration for the given store directory and identity
    pub fn local<P: Into<PathBuf>, S: Into<String>>(store_dir: P, identity: S) -> Self {
        ThawConfig {
            backend: StorageBackend::Local,
            local_store_dir: Some(store_dir.into()),
            ..Self::new(identity)
        }
    }

    /// In-memory configuration, mostly useful in tests
    pub fn memory<S: Into<String>>(identity: S) -> Self {
        ThawConfig {
            backend: StorageBackend::Memory,
            ..Self::new(identity)
        }
    }

    pub fn with_base_path<P: Into<PathBuf>>(mut self, base_path: P) -> Self {
        self.base_path = base_path.into();
        self
    }

    pub fn with_key_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_compression(mut self, compression: CompressionAlgorithm) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_failure_policy(mut self, policy: FlushFailurePolicy) -> Self {
        self.on_flush_failure = policy;
        self
    }

    /// The fixed remote key: `{prefix}/{identity}.{ext}`
    ///
    /// Trailing slashes on the prefix are trimmed and an empty prefix yields a
    /// top-level key, so an unset prefix never produces a key starting with `/`.
    pub fn remote_key(&self) -> String {
        let prefix = self.key_prefix.trim_end_matches('/');
        let ext = self.compression.file_extension();
        if prefix.is_empty() {
            format!("{}.{ext}", self.identity)
        } else {
            format!("{prefix}/{}.{ext}", self.identity)
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.identity.trim().is_empty() {
            return Err(crate::ThawError::validation(
                "Execution identity must not be empty",
            ));
        }
        if self.identity.contains('/') {
            return Err(crate::ThawError::validation(
                "Execution identity must not contain '/'",
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(crate::ThawError::validation(
                "Flush interval must be greater than zero",
            ));
        }
        if !self.base_path.is_absolute() {
            return Err(crate::ThawError::validation(format!(
                "Base path must be absolute: {}",
                self.base_path.display()
            )));
        }
        match self.backend {
            StorageBackend::S3 => {
                if self.s3_bucket.as_deref().map_or(true, str::is_empty) {
                    return Err(crate::ThawError::validation(
                        "S3 backend requires a valid bucket name",
                    ));
                }
            }
            StorageBackend::Local => {
                if self.local_store_dir.is_none() {
                    return Err(crate::ThawError::validation(
                        "Local backend requires a store directory",
                    ));
                }
            }
            StorageBackend::Memory => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ThawConfig::new("my-function");
        assert_eq!(config.backend, StorageBackend::S3);
        assert_eq!(config.base_path, PathBuf::from("/tmp"));
        assert_eq!(config.flush_interval, Duration::from_secs(1));
        assert_eq!(config.compression, CompressionAlgorithm::Zstd);
        assert_eq!(config.on_flush_failure, FlushFailurePolicy::Discard);
    }

    #[test]
    fn test_remote_key_with_prefix() {
        let config = ThawConfig::s3("bucket", "my-function").with_key_prefix("warm/cache");
        assert_eq!(config.remote_key(), "warm/cache/my-function.zst");
    }

    #[test]
    fn test_remote_key_trims_prefix_slashes() {
        let config = ThawConfig::s3("bucket", "fn").with_key_prefix("warm/");
        assert_eq!(config.remote_key(), "warm/fn.zst");
    }

    #[test]
    fn test_remote_key_without_prefix() {
        let config = ThawConfig::s3("bucket", "fn").with_compression(CompressionAlgorithm::Gzip);
        assert_eq!(config.remote_key(), "fn.gz");
    }

    #[test]
    fn test_validate_s3_config() {
        let mut config = ThawConfig::s3("bucket", "fn");
        assert!(config.validate().is_ok());

        config.s3_bucket = None;
        assert!(config.validate().is_err());

        config.s3_bucket = Some("".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_local_config() {
        let config = ThawConfig::local("/var/snapshots", "fn");
        assert!(config.validate().is_ok());

        let mut missing_dir = config.clone();
        missing_dir.local_store_dir = None;
        assert!(missing_dir.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_identity_and_interval() {
        assert!(ThawConfig::memory("").validate().is_err());
        assert!(ThawConfig::memory("a/b").validate().is_err());
        assert!(ThawConfig::memory("fn")
            .with_flush_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(ThawConfig::memory("fn")
            .with_base_path("relative/dir")
            .validate()
            .is_err());
    }

    #[test]
    fn test_parse_backend_and_policy() {
        assert_eq!("S3".parse::<StorageBackend>().unwrap(), StorageBackend::S3);
        assert_eq!("disk".parse::<StorageBackend>().unwrap(), StorageBackend::Local);
        assert!("gcs".parse::<StorageBackend>().is_err());

        assert_eq!(
            "requeue".parse::<FlushFailurePolicy>().unwrap(),
            FlushFailurePolicy::Requeue
        );
        assert!("retry".parse::<FlushFailurePolicy>().is_err());
    }
}
