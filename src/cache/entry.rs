//! Cache Entry Types
//!
//! Keys, the self-describing entry envelope shared by every tier, and the
//! tier-membership mask.
//!
//! # Envelope
//!
//! Tiers store opaque bytes. The envelope prefixes each payload with a
//! fixed header (magic, version, flags, timestamps, raw size, content
//! hash) plus a partition/key echo, so expiry checks, corruption
//! detection, and hash-collision rejection work identically whether the
//! bytes came from process memory, a file, or a remote layer.

use std::hash::{Hash, Hasher};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::tier::TierId;

/// Envelope magic ("SCE1" - StrataCache Entry v1 family)
const MAGIC: u32 = 0x5343_4531;
/// Current envelope version
const VERSION: u8 = 1;
/// Flag bit: payload is LZ4-compressed
const FLAG_COMPRESSED: u8 = 0b0000_0001;
/// Fixed header length ahead of the partition/key echo
const HEADER_LEN: usize = 4 + 1 + 1 + 8 + 8 + 8 + 8 + 2 + 2;

/// Cache key - composite of partition and object key
#[derive(Clone, Debug, Eq)]
pub struct CacheKey {
    /// Partition name hash (for fast comparison)
    partition_hash: u64,
    /// Object key hash
    key_hash: u64,
    /// Full partition name (for collision resolution)
    partition: String,
    /// Full object key
    key: String,
}

impl CacheKey {
    /// Create a new cache key
    pub fn new(partition: impl Into<String>, key: impl Into<String>) -> Self {
        let partition = partition.into();
        let key = key.into();

        let partition_hash = fx_hash(partition.as_bytes());
        let key_hash = fx_hash(key.as_bytes());

        Self {
            partition_hash,
            key_hash,
            partition,
            key,
        }
    }

    /// Get partition name
    #[inline]
    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Get object key
    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get combined hash for placement and file naming
    #[inline]
    pub fn combined_hash(&self) -> u64 {
        self.partition_hash ^ self.key_hash
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        // Fast path: compare hashes first
        if self.partition_hash != other.partition_hash || self.key_hash != other.key_hash {
            return false;
        }
        self.partition == other.partition && self.key == other.key
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Use pre-computed hashes
        self.partition_hash.hash(state);
        self.key_hash.hash(state);
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.partition, self.key)
    }
}

/// Fast non-cryptographic hash (FxHash algorithm)
#[inline]
pub fn fx_hash(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    hash
}

/// Bitmask of tiers currently holding an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierMask(u8);

impl TierMask {
    /// Empty mask
    pub fn empty() -> Self {
        Self(0)
    }

    /// Mark a tier as holding the entry
    pub fn insert(&mut self, tier: TierId) {
        self.0 |= 1 << tier.index();
    }

    /// Check whether a tier holds the entry
    pub fn contains(&self, tier: TierId) -> bool {
        self.0 & (1 << tier.index()) != 0
    }

    /// Number of tiers holding the entry
    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// Tiers in the mask, fastest first
    pub fn tiers(&self) -> Vec<TierId> {
        TierId::ALL.iter().copied().filter(|t| self.contains(*t)).collect()
    }
}

/// Self-describing cache entry as stored in every tier.
#[derive(Debug, Clone)]
pub struct EntryEnvelope {
    /// Partition echo (collision rejection)
    pub partition: String,
    /// Key echo (collision rejection)
    pub key: String,
    /// Payload is LZ4-compressed
    pub compressed: bool,
    /// Creation time (epoch millis)
    pub created_at_ms: u64,
    /// Expiry deadline (epoch millis)
    pub expires_at_ms: u64,
    /// Size of the raw (uncompressed) payload
    pub raw_size: u64,
    /// FxHash of the raw payload, verified after decompression
    pub content_hash: u64,
    /// Stored payload (compressed form when `compressed` is set)
    pub payload: Bytes,
}

impl EntryEnvelope {
    /// Bytes the stored payload occupies (not counting the header).
    #[inline]
    pub fn stored_size(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Total encoded size, header included. This is what counts against
    /// partition capacity.
    #[inline]
    pub fn encoded_size(&self) -> u64 {
        (HEADER_LEN + self.partition.len() + self.key.len() + self.payload.len()) as u64
    }

    /// Check expiry against a clock reading.
    #[inline]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms < now_ms
    }

    /// Whether the envelope echo matches the requested key.
    pub fn matches(&self, key: &CacheKey) -> bool {
        self.partition == key.partition() && self.key == key.key()
    }

    /// Serialize to wire form.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            HEADER_LEN + self.partition.len() + self.key.len() + self.payload.len(),
        );
        buf.put_u32(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(if self.compressed { FLAG_COMPRESSED } else { 0 });
        buf.put_u64(self.created_at_ms);
        buf.put_u64(self.expires_at_ms);
        buf.put_u64(self.raw_size);
        buf.put_u64(self.content_hash);
        buf.put_u16(self.partition.len() as u16);
        buf.put_u16(self.key.len() as u16);
        buf.put_slice(self.partition.as_bytes());
        buf.put_slice(self.key.as_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Deserialize from wire form, validating structure.
    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::CorruptEntry(format!(
                "envelope too short: {} bytes",
                data.len()
            )));
        }

        let magic = data.get_u32();
        if magic != MAGIC {
            return Err(Error::CorruptEntry(format!("bad magic: {magic:#010x}")));
        }

        let version = data.get_u8();
        if version != VERSION {
            return Err(Error::CorruptEntry(format!("unsupported version: {version}")));
        }

        let flags = data.get_u8();
        let created_at_ms = data.get_u64();
        let expires_at_ms = data.get_u64();
        let raw_size = data.get_u64();
        let content_hash = data.get_u64();
        let partition_len = data.get_u16() as usize;
        let key_len = data.get_u16() as usize;

        if data.len() < partition_len + key_len {
            return Err(Error::CorruptEntry("truncated key echo".to_string()));
        }

        let partition = String::from_utf8(data.split_to(partition_len).to_vec())
            .map_err(|_| Error::CorruptEntry("partition echo not utf-8".to_string()))?;
        let key = String::from_utf8(data.split_to(key_len).to_vec())
            .map_err(|_| Error::CorruptEntry("key echo not utf-8".to_string()))?;

        Ok(Self {
            partition,
            key,
            compressed: flags & FLAG_COMPRESSED != 0,
            created_at_ms,
            expires_at_ms,
            raw_size,
            content_hash,
            payload: data,
        })
    }

    /// Decode only the header fields, without materializing the payload.
    /// Used by the persistent tier when rebuilding its index.
    pub fn decode_header(data: &[u8]) -> Result<(String, u64, u64)> {
        let envelope = Self::decode(Bytes::copy_from_slice(data))?;
        let stored_size = envelope.stored_size();
        Ok((envelope.key, envelope.expires_at_ms, stored_size))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn make_envelope(partition: &str, key: &str, payload: &[u8]) -> EntryEnvelope {
        EntryEnvelope {
            partition: partition.to_string(),
            key: key.to_string(),
            compressed: false,
            created_at_ms: 1_000,
            expires_at_ms: 61_000,
            raw_size: payload.len() as u64,
            content_hash: fx_hash(payload),
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn test_cache_key_creation() {
        let key = CacheKey::new("feed_posts", "post:42");
        assert_eq!(key.partition(), "feed_posts");
        assert_eq!(key.key(), "post:42");
    }

    #[test]
    fn test_cache_key_equality() {
        let key1 = CacheKey::new("p", "k");
        let key2 = CacheKey::new("p", "k");
        let key3 = CacheKey::new("p", "other");

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
    }

    #[test]
    fn test_cache_key_hashing() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(CacheKey::new("p", "k1").combined_hash());
        set.insert(CacheKey::new("p", "k1").combined_hash());
        set.insert(CacheKey::new("p", "k2").combined_hash());

        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_tier_mask() {
        let mut mask = TierMask::empty();
        assert_eq!(mask.count(), 0);

        mask.insert(TierId::L1Memory);
        mask.insert(TierId::L3Cluster);

        assert!(mask.contains(TierId::L1Memory));
        assert!(!mask.contains(TierId::L2Persistent));
        assert_eq!(mask.count(), 2);
        assert_eq!(mask.tiers(), vec![TierId::L1Memory, TierId::L3Cluster]);
    }

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = make_envelope("user_profiles", "user:7", b"profile payload");
        let encoded = envelope.encode();
        let decoded = EntryEnvelope::decode(encoded).unwrap();

        assert_eq!(decoded.partition, "user_profiles");
        assert_eq!(decoded.key, "user:7");
        assert!(!decoded.compressed);
        assert_eq!(decoded.created_at_ms, 1_000);
        assert_eq!(decoded.expires_at_ms, 61_000);
        assert_eq!(decoded.payload.as_ref(), b"profile payload");
        assert_eq!(decoded.content_hash, envelope.content_hash);
    }

    #[test]
    fn test_envelope_expiry() {
        let envelope = make_envelope("p", "k", b"data");
        assert!(!envelope.is_expired(61_000));
        assert!(envelope.is_expired(61_001));
    }

    #[test]
    fn test_envelope_key_echo() {
        let envelope = make_envelope("p", "k", b"data");
        assert!(envelope.matches(&CacheKey::new("p", "k")));
        assert!(!envelope.matches(&CacheKey::new("p", "collision")));
    }

    #[test]
    fn test_envelope_rejects_garbage() {
        assert!(EntryEnvelope::decode(Bytes::from_static(b"short")).is_err());

        let mut bad_magic = make_envelope("p", "k", b"data").encode().to_vec();
        bad_magic[0] ^= 0xFF;
        assert!(EntryEnvelope::decode(Bytes::from(bad_magic)).is_err());
    }

    #[test]
    fn test_envelope_rejects_truncated_echo() {
        let encoded = make_envelope("p", "key-name", b"data").encode();
        // Cut into the key echo region
        let truncated = encoded.slice(0..HEADER_LEN + 2);
        assert!(EntryEnvelope::decode(truncated).is_err());
    }

    #[test]
    fn test_encoded_size_counts_header() {
        let envelope = make_envelope("p", "k", b"data");
        assert_eq!(envelope.encoded_size(), envelope.encode().len() as u64);
        assert!(envelope.encoded_size() > envelope.stored_size());
    }

    #[test]
    fn test_decode_header() {
        let envelope = make_envelope("p", "some-key", b"payload!");
        let (key, expires, size) = EntryEnvelope::decode_header(&envelope.encode()).unwrap();
        assert_eq!(key, "some-key");
        assert_eq!(expires, 61_000);
        assert_eq!(size, 8);
    }
}
