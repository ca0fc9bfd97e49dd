/*!
Compression adapters for snapshot archives.

The snapshot body is wrapped in a single streaming-compression frame before it is
uploaded. zstd is the default; gzip is kept for environments that prefer it. Every
call builds its own encoder/decoder, so one adapter can be shared freely between the
flush task and a restore.
*/

use std::io::{Read, Write};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};

use crate::{Result, ThawError};

/// Compression abstraction for snapshot data
///
/// This trait defines the interface for all compression implementations.
/// It allows the snapshot codec to work with different compression algorithms
/// without being coupled to any specific implementation.
pub trait CompressionAdapter: Send + Sync {
    /// Compress the input data
    ///
    /// # Arguments
    /// * `data` - The data to compress
    ///
    /// # Returns
    /// The compressed data or an error
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress the input data
    ///
    /// # Arguments
    /// * `compressed_data` - The compressed data to decompress
    ///
    /// # Returns
    /// The decompressed data or an error
    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>>;

    /// Get the name of the compression algorithm
    fn algorithm_name(&self) -> &str;

    /// File extension used for the remote object key
    fn file_extension(&self) -> &str;
}

/// Supported compression algorithms, selectable from configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    Zstd,
    Gzip,
}

impl CompressionAlgorithm {
    /// Build the adapter for this algorithm with its default level
    pub fn adapter(self) -> Box<dyn CompressionAdapter> {
        match self {
            CompressionAlgorithm::Zstd => Box::new(ZstdCompressor::new()),
            CompressionAlgorithm::Gzip => Box::new(GzipCompressor::new()),
        }
    }

    /// Extension appended to the remote key
    pub fn file_extension(self) -> &'static str {
        match self {
            CompressionAlgorithm::Zstd => "zst",
            CompressionAlgorithm::Gzip => "gz",
        }
    }
}

impl std::str::FromStr for CompressionAlgorithm {
    type Err = ThawError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "zstd" | "zst" => Ok(CompressionAlgorithm::Zstd),
            "gzip" | "gz" => Ok(CompressionAlgorithm::Gzip),
            other => Err(ThawError::validation(format!(
                "Unknown compression algorithm '{other}' (expected zstd or gzip)"
            ))),
        }
    }
}

/// Zstandard compression adapter
///
/// # Example
/// ```rust
/// use thaw_core::compression::{CompressionAdapter, ZstdCompressor};
///
/// let compressor = ZstdCompressor::new();
/// let data = b"scratch directory contents";
/// let compressed = compressor.compress(data)?;
/// let decompressed = compressor.decompress(&compressed)?;
/// assert_eq!(data, &decompressed[..]);
/// # Ok::<(), thaw_core::ThawError>(())
/// ```
#[derive(Debug, Clone)]
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    /// Create a new zstd compressor with the library default level (3)
    pub fn new() -> Self {
        Self {
            level: zstd::DEFAULT_COMPRESSION_LEVEL,
        }
    }

    /// Create a new zstd compressor with the specified level (1-22)
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for ZstdCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::stream::encode_all(data, self.level)
            .map_err(|e| ThawError::compression(format!("Failed to compress with zstd: {e}")))
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        zstd::stream::decode_all(compressed_data)
            .map_err(|e| ThawError::compression(format!("Failed to decompress zstd frame: {e}")))
    }

    fn algorithm_name(&self) -> &str {
        "zstd"
    }

    fn file_extension(&self) -> &str {
        CompressionAlgorithm::Zstd.file_extension()
    }
}

/// Gzip compression adapter
///
/// Uses DEFLATE (gzip) framing. Slower to decode than zstd but readable by any
/// stock `tar -xzf`.
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    compression_level: Compression,
}

impl GzipCompressor {
    /// Create a new gzip compressor with default compression level (6)
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }

    /// Create a new gzip compressor with the specified compression level (0-9)
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level),
        }
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), self.compression_level);

        encoder
            .write_all(data)
            .map_err(|e| ThawError::compression(format!("Failed to write data for compression: {e}")))?;

        encoder
            .finish()
            .map_err(|e| ThawError::compression(format!("Failed to finish compression: {e}")))
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(compressed_data);
        let mut decompressed = Vec::new();

        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| ThawError::compression(format!("Failed to decompress data: {e}")))?;

        Ok(decompressed)
    }

    fn algorithm_name(&self) -> &str {
        "gzip"
    }

    fn file_extension(&self) -> &str {
        CompressionAlgorithm::Gzip.file_extension()
    }
}
