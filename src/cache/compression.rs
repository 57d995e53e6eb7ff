//! Payload Compression
//!
//! LZ4 compression applied above a size threshold, with trial compression:
//! the compressed form is kept only when it is actually smaller.
//!
//! # Example
//!
//! ```
//! use stratacache::cache::compression::{CompressionCodec, CompressionConfig};
//!
//! let codec = CompressionCodec::new(CompressionConfig {
//!     threshold_bytes: 16,
//!     level: 4,
//! });
//!
//! let data = vec![7u8; 1024];
//! let (stored, compressed) = codec.encode(&data);
//! assert!(compressed);
//! assert!(stored.len() < data.len());
//!
//! let restored = codec.decode(&stored, compressed).unwrap();
//! assert_eq!(restored.as_ref(), &data[..]);
//! ```

use bytes::Bytes;

use crate::error::{Error, Result};

/// Compression configuration
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Payloads at or below this size are stored raw
    pub threshold_bytes: usize,
    /// LZ4 compression level
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: 1024,
            level: 4,
        }
    }
}

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    /// Algorithm name for error reporting
    fn name(&self) -> &'static str;

    /// Compress data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress data
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through compressor (no compression)
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn name(&self) -> &'static str {
        "none"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// LZ4 compressor
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    /// Create with a compression level
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self { level: 4 }
    }
}

impl Compressor for Lz4Compressor {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "lz4".into(),
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "lz4".into(),
            reason: e.to_string(),
        })
    }
}

/// Threshold + trial-compression codec used by the engine.
pub struct CompressionCodec {
    config: CompressionConfig,
    lz4: Lz4Compressor,
}

impl CompressionCodec {
    /// Create a codec from configuration
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            lz4: Lz4Compressor::with_level(config.level),
            config,
        }
    }

    /// Encode a payload for storage.
    ///
    /// Returns `(stored_bytes, compressed)`. Compression is applied iff
    /// the raw size exceeds the threshold AND the trial-compressed form
    /// is smaller; otherwise the raw bytes are stored. A compression
    /// failure degrades to raw storage.
    pub fn encode(&self, data: &[u8]) -> (Bytes, bool) {
        if data.len() <= self.config.threshold_bytes {
            return (Bytes::copy_from_slice(data), false);
        }

        match self.lz4.compress(data) {
            Ok(compressed) if compressed.len() < data.len() => (Bytes::from(compressed), true),
            Ok(_) => (Bytes::copy_from_slice(data), false),
            Err(e) => {
                tracing::warn!("compression failed, storing raw: {}", e);
                (Bytes::copy_from_slice(data), false)
            }
        }
    }

    /// Decode a stored payload back to its raw form.
    pub fn decode(&self, data: &[u8], compressed: bool) -> Result<Bytes> {
        if !compressed {
            return Ok(Bytes::copy_from_slice(data));
        }
        Ok(Bytes::from(self.lz4.decompress(data)?))
    }

    /// Get configuration
    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }
}

impl Default for CompressionCodec {
    fn default() -> Self {
        Self::new(CompressionConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TEST_DATA: &[u8] = b"Hello, this is test data that should compress well. \
        It has some repetition: Hello, this is test data that should compress well.";

    fn codec(threshold: usize) -> CompressionCodec {
        CompressionCodec::new(CompressionConfig {
            threshold_bytes: threshold,
            level: 4,
        })
    }

    #[test]
    fn test_lz4_roundtrip() {
        let compressor = Lz4Compressor::default();

        let compressed = compressor.compress(TEST_DATA).unwrap();
        assert!(compressed.len() < TEST_DATA.len());

        let decompressed = compressor.decompress(&compressed).unwrap();
        assert_eq!(decompressed, TEST_DATA);
    }

    #[test]
    fn test_noop_roundtrip() {
        let compressor = NoopCompressor;
        let out = compressor.compress(TEST_DATA).unwrap();
        assert_eq!(out, TEST_DATA);
        assert_eq!(compressor.decompress(&out).unwrap(), TEST_DATA);
    }

    #[test]
    fn test_below_threshold_stored_raw() {
        let codec = codec(1024);
        let (stored, compressed) = codec.encode(b"tiny");
        assert!(!compressed);
        assert_eq!(stored.as_ref(), b"tiny");
    }

    #[test]
    fn test_above_threshold_compressed() {
        let codec = codec(16);
        let (stored, compressed) = codec.encode(TEST_DATA);
        assert!(compressed);
        assert!(stored.len() < TEST_DATA.len());

        let restored = codec.decode(&stored, compressed).unwrap();
        assert_eq!(restored.as_ref(), TEST_DATA);
    }

    #[test]
    fn test_incompressible_kept_raw() {
        let codec = codec(16);
        // High-entropy bytes rarely shrink under LZ4
        let noise: Vec<u8> = (0..512u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();

        let (stored, compressed) = codec.encode(&noise);
        if compressed {
            assert!(stored.len() < noise.len());
        } else {
            assert_eq!(stored.as_ref(), &noise[..]);
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let codec = codec(16);
        assert!(codec.decode(b"\x01\x02\x03not lz4", true).is_err());
    }

    proptest! {
        #[test]
        fn prop_roundtrip(payload in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let codec = codec(64);
            let (stored, compressed) = codec.encode(&payload);
            let restored = codec.decode(&stored, compressed).unwrap();
            prop_assert_eq!(restored.as_ref(), &payload[..]);
        }

        #[test]
        fn prop_stored_never_larger_when_compressed(
            payload in proptest::collection::vec(any::<u8>(), 0..4096)
        ) {
            let codec = codec(64);
            let (stored, compressed) = codec.encode(&payload);
            if compressed {
                prop_assert!(stored.len() < payload.len());
            }
        }
    }
}
