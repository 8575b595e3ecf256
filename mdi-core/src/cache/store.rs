//! Persistent-tier storage interface and the in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::cache::SliceKey;
use crate::error::StorageError;
use crate::protocol::SliceDataPayload;

/// A slice as held by an L2 store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSlice {
    pub slice: SliceDataPayload,
    pub stored_at_ms: u64,
    pub expires_at_ms: u64,
}

impl StoredSlice {
    pub fn size_bytes(&self) -> u64 {
        self.slice.size_bytes() as u64
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

/// Index record returned by [`SliceStore::entries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    pub key: SliceKey,
    pub size_bytes: u64,
    pub stored_at_ms: u64,
    pub expires_at_ms: u64,
}

/// Bytes used by a store and, when it has one, its quota.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageEstimate {
    pub usage: u64,
    pub quota: Option<u64>,
}

/// Key-value backend behind the L2 tier.
///
/// Byte budgeting and expiry are enforced by the cache; a store only
/// persists what it is given. Any error surfaces to the caller as
/// [`MdiError::CacheStorage`](crate::MdiError::CacheStorage).
#[async_trait]
pub trait SliceStore: Send + Sync {
    async fn get(&self, key: &SliceKey) -> Result<Option<StoredSlice>, StorageError>;

    async fn put(&self, key: &SliceKey, value: StoredSlice) -> Result<(), StorageError>;

    async fn delete(&self, key: &SliceKey) -> Result<(), StorageError>;

    async fn clear(&self) -> Result<(), StorageError>;

    /// Every stored entry, used to rebuild the cache index on open.
    async fn entries(&self) -> Result<Vec<StoreEntry>, StorageError>;

    async fn estimate(&self) -> Result<StorageEstimate, StorageError>;
}

// ── MemoryStore ──────────────────────────────────────────────────

/// Volatile store; contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<SliceKey, StoredSlice>>,
    quota: Option<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse puts that would take usage past `quota` bytes.
    pub fn with_quota(quota: u64) -> Self {
        Self {
            entries: Mutex::default(),
            quota: Some(quota),
        }
    }
}

fn usage_of(entries: &HashMap<SliceKey, StoredSlice>) -> u64 {
    entries.values().map(StoredSlice::size_bytes).sum()
}

#[async_trait]
impl SliceStore for MemoryStore {
    async fn get(&self, key: &SliceKey) -> Result<Option<StoredSlice>, StorageError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &SliceKey, value: StoredSlice) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().await;
        if let Some(quota) = self.quota {
            let current = usage_of(&entries) - entries.get(key).map_or(0, StoredSlice::size_bytes);
            let needed = value.size_bytes();
            if current + needed > quota {
                return Err(StorageError::QuotaExceeded {
                    needed,
                    available: quota.saturating_sub(current),
                });
            }
        }
        entries.insert(key.clone(), value);
        Ok(())
    }

    async fn delete(&self, key: &SliceKey) -> Result<(), StorageError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.entries.lock().await.clear();
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<StoreEntry>, StorageError> {
        Ok(self
            .entries
            .lock()
            .await
            .iter()
            .map(|(key, v)| StoreEntry {
                key: key.clone(),
                size_bytes: v.size_bytes(),
                stored_at_ms: v.stored_at_ms,
                expires_at_ms: v.expires_at_ms,
            })
            .collect())
    }

    async fn estimate(&self) -> Result<StorageEstimate, StorageError> {
        Ok(StorageEstimate {
            usage: usage_of(&*self.entries.lock().await),
            quota: self.quota,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PixelBuffer;

    fn stored(index: u32, pixels: usize) -> StoredSlice {
        StoredSlice {
            slice: SliceDataPayload {
                file_id: "vol".into(),
                slice_index: index,
                width: pixels as u32,
                height: 1,
                min_value: 0.0,
                max_value: 1.0,
                window_center: 0.5,
                window_width: 1.0,
                data: PixelBuffer::from_values(&vec![0u8; pixels]),
            },
            stored_at_ms: 10,
            expires_at_ms: 20,
        }
    }

    #[tokio::test]
    async fn memory_store_basic_ops() {
        let store = MemoryStore::new();
        let key = SliceKey::new("vol", 1);
        store.put(&key, stored(1, 16)).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap().unwrap().size_bytes(), 16);
        assert_eq!(store.estimate().await.unwrap().usage, 16);
        assert_eq!(store.entries().await.unwrap().len(), 1);

        store.delete(&key).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn quota_is_enforced() {
        let store = MemoryStore::with_quota(20);
        store.put(&SliceKey::new("vol", 1), stored(1, 16)).await.unwrap();
        let err = store.put(&SliceKey::new("vol", 2), stored(2, 8)).await.unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { needed: 8, available: 4 }));
        // Replacing an entry only counts the difference.
        store.put(&SliceKey::new("vol", 1), stored(1, 18)).await.unwrap();
    }

    #[test]
    fn expiry_is_inclusive() {
        let s = stored(0, 1);
        assert!(!s.is_expired(19));
        assert!(s.is_expired(20));
    }
}
