//! Error types for the StrataCache engine

use thiserror::Error;

use crate::tier::TierId;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the StrataCache engine
#[derive(Error, Debug)]
pub enum Error {
    /// Unknown partition name. This is a caller programming error and the
    /// only tier-path error surfaced synchronously to callers.
    #[error("Unknown partition: {0}")]
    InvalidPartition(String),

    /// A tier is unavailable (breaker open or probe failed). Non-fatal,
    /// the tier is skipped.
    #[error("Tier {tier} unavailable: {reason}")]
    TierUnavailable { tier: TierId, reason: String },

    /// A write could not be admitted to a partition even after eviction.
    #[error("Capacity exceeded in partition {partition}: need {needed} bytes, capacity {capacity}")]
    CapacityExceeded {
        partition: String,
        needed: u64,
        capacity: u64,
    },

    /// Entry envelope failed decoding or an integrity check. The entry is
    /// deleted and the read treated as a miss.
    #[error("Corrupt entry: {0}")]
    CorruptEntry(String),

    /// Tier call exceeded its configured deadline.
    #[error("Tier {tier} timed out after {timeout_ms}ms")]
    TierTimeout { tier: TierId, timeout_ms: u64 },

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors that degrade to a miss or no-op instead of
    /// propagating to the application.
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            Error::TierUnavailable { .. }
                | Error::TierTimeout { .. }
                | Error::CapacityExceeded { .. }
                | Error::CorruptEntry(_)
        )
    }
}
