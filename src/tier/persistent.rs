//! L2 Tier - Local Persistent Store
//!
//! Warm tier that survives process restart: one envelope file per entry
//! under a directory per partition, with an in-memory index rebuilt from
//! the envelope headers at open. Writes go through a temp file + rename
//! so a crash never leaves a torn entry visible.
//!
//! File names are the key hash; the envelope's key echo disambiguates
//! hash collisions at read time.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::cache::entry::{fx_hash, EntryEnvelope};
use crate::error::{Error, Result};
use crate::failover::Clock;
use crate::tier::{ScanItem, TierId, TierStore};

/// L2 configuration
#[derive(Debug, Clone)]
pub struct PersistentConfig {
    /// Directory holding one subdirectory per partition
    pub root_dir: PathBuf,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    path: PathBuf,
    stored_size: u64,
    expires_at_ms: u64,
}

/// File-backed persistent tier.
pub struct PersistentTier {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    /// "partition\x00key" → file location
    index: DashMap<String, IndexEntry>,
}

impl PersistentTier {
    /// Open the store, rebuilding the index from envelope headers on disk.
    pub fn open(config: PersistentConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        std::fs::create_dir_all(&config.root_dir)?;

        let tier = Self {
            root: config.root_dir,
            clock,
            index: DashMap::new(),
        };
        tier.rebuild_index()?;
        Ok(tier)
    }

    fn rebuild_index(&self) -> Result<()> {
        let mut recovered = 0usize;
        let mut discarded = 0usize;

        for partition_dir in std::fs::read_dir(&self.root)? {
            let partition_dir = partition_dir?;
            if !partition_dir.file_type()?.is_dir() {
                continue;
            }
            let partition = partition_dir.file_name().to_string_lossy().to_string();

            for entry_file in std::fs::read_dir(partition_dir.path())? {
                let entry_file = entry_file?;
                let path = entry_file.path();
                if path.extension().map(|e| e != "entry").unwrap_or(true) {
                    continue;
                }

                let data = std::fs::read(&path)?;
                match EntryEnvelope::decode_header(&data) {
                    Ok((key, expires_at_ms, stored_size)) => {
                        self.index.insert(
                            Self::index_key(&partition, &key),
                            IndexEntry {
                                path,
                                stored_size,
                                expires_at_ms,
                            },
                        );
                        recovered += 1;
                    }
                    Err(e) => {
                        // Torn or foreign file; drop it rather than serve it
                        warn!(path = %path.display(), "discarding unreadable entry: {}", e);
                        let _ = std::fs::remove_file(&path);
                        discarded += 1;
                    }
                }
            }
        }

        debug!(recovered, discarded, "persistent tier index rebuilt");
        Ok(())
    }

    fn index_key(partition: &str, key: &str) -> String {
        format!("{partition}\x00{key}")
    }

    fn entry_path(&self, partition: &str, key: &str) -> PathBuf {
        let hash = fx_hash(key.as_bytes());
        self.root.join(partition).join(format!("{hash:016x}.entry"))
    }

    async fn remove_file_and_index(&self, index_key: &str, path: &Path) {
        self.index.remove(index_key);
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), "failed to remove entry file: {}", e);
            }
        }
    }

    /// Number of indexed entries (all partitions).
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// True when no entries are indexed.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[async_trait]
impl TierStore for PersistentTier {
    fn id(&self) -> TierId {
        TierId::L2Persistent
    }

    async fn get(&self, partition: &str, key: &str) -> Result<Option<Bytes>> {
        let index_key = Self::index_key(partition, key);

        let located = match self.index.get(&index_key) {
            Some(entry) => entry.value().clone(),
            None => return Ok(None),
        };

        if located.expires_at_ms < self.clock.now_ms() {
            self.remove_file_and_index(&index_key, &located.path).await;
            return Ok(None);
        }

        match tokio::fs::read(&located.path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Index drifted from disk; heal and report a miss
                self.index.remove(&index_key);
                Ok(None)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn set(&self, partition: &str, key: &str, data: Bytes, ttl: Duration) -> Result<()> {
        let path = self.entry_path(partition, key);
        let dir = path.parent().ok_or_else(|| {
            Error::Internal(format!("entry path has no parent: {}", path.display()))
        })?;
        tokio::fs::create_dir_all(dir).await?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        self.index.insert(
            Self::index_key(partition, key),
            IndexEntry {
                path,
                stored_size: data.len() as u64,
                expires_at_ms: self.clock.now_ms() + ttl.as_millis() as u64,
            },
        );
        Ok(())
    }

    async fn delete(&self, partition: &str, key: &str) -> Result<bool> {
        let index_key = Self::index_key(partition, key);
        match self.index.remove(&index_key) {
            Some((_, entry)) => {
                if let Err(e) = tokio::fs::remove_file(&entry.path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(Error::Io(e));
                    }
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn scan(&self, partition: &str) -> Result<Vec<ScanItem>> {
        let prefix = format!("{partition}\x00");
        Ok(self
            .index
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| ScanItem {
                key: entry.key()[prefix.len()..].to_string(),
                expires_at_ms: entry.value().expires_at_ms,
                stored_size: entry.value().stored_size,
            })
            .collect())
    }

    async fn health_probe(&self) -> Result<()> {
        tokio::fs::metadata(&self.root).await?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failover::ManualClock;

    fn envelope_bytes(partition: &str, key: &str, payload: &[u8], expires_at_ms: u64) -> Bytes {
        EntryEnvelope {
            partition: partition.to_string(),
            key: key.to_string(),
            compressed: false,
            created_at_ms: 0,
            expires_at_ms,
            raw_size: payload.len() as u64,
            content_hash: fx_hash(payload),
            payload: Bytes::copy_from_slice(payload),
        }
        .encode()
    }

    fn open_tier(dir: &Path, clock: Arc<ManualClock>) -> PersistentTier {
        PersistentTier::open(
            PersistentConfig {
                root_dir: dir.to_path_buf(),
            },
            clock,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::at(1_000));
        let tier = open_tier(dir.path(), clock);

        let data = envelope_bytes("p", "k", b"persisted", 100_000);
        tier.set("p", "k", data.clone(), Duration::from_secs(60))
            .await
            .unwrap();

        let got = tier.get("p", "k").await.unwrap().unwrap();
        assert_eq!(got, data);
    }

    #[tokio::test]
    async fn test_miss_on_absent_key() {
        let dir = tempfile::tempdir().unwrap();
        let tier = open_tier(dir.path(), Arc::new(ManualClock::at(1_000)));
        assert!(tier.get("p", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let tier = open_tier(dir.path(), Arc::new(ManualClock::at(1_000)));

        let data = envelope_bytes("p", "k", b"data", 100_000);
        tier.set("p", "k", data, Duration::from_secs(60)).await.unwrap();

        assert!(tier.delete("p", "k").await.unwrap());
        assert!(!tier.delete("p", "k").await.unwrap());
        assert!(tier.get("p", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_index_entry_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::at(1_000));
        let tier = open_tier(dir.path(), clock.clone());

        let data = envelope_bytes("p", "k", b"data", 6_000);
        tier.set("p", "k", data, Duration::from_secs(5)).await.unwrap();

        clock.advance(10_000);

        assert!(tier.get("p", "k").await.unwrap().is_none());
        assert!(tier.is_empty());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::at(1_000));

        let data = envelope_bytes("p", "k", b"durable", 100_000);
        {
            let tier = open_tier(dir.path(), clock.clone());
            tier.set("p", "k", data.clone(), Duration::from_secs(600))
                .await
                .unwrap();
        }

        let reopened = open_tier(dir.path(), clock);
        assert_eq!(reopened.len(), 1);

        let got = reopened.get("p", "k").await.unwrap().unwrap();
        assert_eq!(got, data);
    }

    #[tokio::test]
    async fn test_reopen_discards_torn_files() {
        let dir = tempfile::tempdir().unwrap();
        let partition_dir = dir.path().join("p");
        std::fs::create_dir_all(&partition_dir).unwrap();
        std::fs::write(partition_dir.join("deadbeef.entry"), b"not an envelope").unwrap();

        let tier = open_tier(dir.path(), Arc::new(ManualClock::at(1_000)));
        assert!(tier.is_empty());
        assert!(!partition_dir.join("deadbeef.entry").exists());
    }

    #[tokio::test]
    async fn test_scan_is_partition_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let tier = open_tier(dir.path(), Arc::new(ManualClock::at(1_000)));

        tier.set("p1", "a", envelope_bytes("p1", "a", b"x", 100_000), Duration::from_secs(60))
            .await
            .unwrap();
        tier.set("p2", "b", envelope_bytes("p2", "b", b"y", 100_000), Duration::from_secs(60))
            .await
            .unwrap();

        let items = tier.scan("p1").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key, "a");
    }

    #[tokio::test]
    async fn test_health_probe() {
        let dir = tempfile::tempdir().unwrap();
        let tier = open_tier(dir.path(), Arc::new(ManualClock::at(1_000)));
        assert!(tier.health_probe().await.is_ok());
    }

    #[tokio::test]
    async fn test_overwrite_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let tier = open_tier(dir.path(), Arc::new(ManualClock::at(1_000)));

        tier.set("p", "k", envelope_bytes("p", "k", b"v1", 100_000), Duration::from_secs(60))
            .await
            .unwrap();
        let v2 = envelope_bytes("p", "k", b"v2", 100_000);
        tier.set("p", "k", v2.clone(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(tier.len(), 1);
        assert_eq!(tier.get("p", "k").await.unwrap().unwrap(), v2);
    }
}
