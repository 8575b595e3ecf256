//! Two-tier slice cache with access-pattern prefetch.
//!
//! L1 holds decoded slices in memory, bounded by entry count. L2 sits on a
//! [`SliceStore`] and is bounded by total pixel bytes, with a TTL per
//! entry. Both tiers evict least-recently-used first. Every public method
//! takes the one async mutex for its whole duration, store I/O included,
//! so the LRU order and byte accounting always agree with the store.
//!
//! Reads feed the [`prefetch`] planner. Requests it queues are pulled with
//! [`SliceCache::next_prefetch`]; [`SliceCache::prefetch_ready`] wakes when
//! there is new work.

mod disk;
pub mod prefetch;
mod stats;
mod store;
mod tier;

pub use disk::DiskStore;
pub use prefetch::{Direction, PrefetchRequest};
pub use stats::{CacheStats, TierStats};
pub use store::{MemoryStore, SliceStore, StorageEstimate, StoreEntry, StoredSlice};

use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{CacheConfig, StorageConfig};
use crate::error::{MdiError, StorageError};
use crate::protocol::SliceDataPayload;

use prefetch::{Pattern, PrefetchQueue};
use tier::LruIndex;

/// Cache key: a slice within a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SliceKey {
    pub file_id: String,
    pub slice_index: u32,
}

impl SliceKey {
    pub fn new(file_id: impl Into<String>, slice_index: u32) -> Self {
        Self {
            file_id: file_id.into(),
            slice_index,
        }
    }
}

impl fmt::Display for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_id, self.slice_index)
    }
}

/// Which tier an entry was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    L1,
    L2,
}

/// Bookkeeping for one cached slice, as reported by
/// [`SliceCache::entry_info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub tier: Tier,
    pub size_bytes: u64,
    pub access_count: u64,
    pub last_access_ms: u64,
    /// Only L2 entries expire.
    pub expires_at_ms: Option<u64>,
}

#[derive(Debug)]
struct L1Entry {
    slice: SliceDataPayload,
    last_access_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct L2Meta {
    size_bytes: u64,
    expires_at_ms: u64,
    last_access_ms: u64,
}

#[derive(Debug)]
struct Inner {
    l1: LruIndex<L1Entry>,
    l2: LruIndex<L2Meta>,
    l2_bytes: u64,
    prefetch: PrefetchQueue,
    stats: CacheStats,
}

pub struct SliceCache {
    inner: Mutex<Inner>,
    store: Arc<dyn SliceStore>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    prefetch_ready: Notify,
}

impl fmt::Debug for SliceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SliceCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SliceCache {
    /// Build the cache and its configured L2 store on the system clock.
    pub async fn open(config: CacheConfig) -> Result<Self, MdiError> {
        config.validate()?;
        let store: Arc<dyn SliceStore> = match &config.storage {
            StorageConfig::Memory => Arc::new(MemoryStore::new()),
            StorageConfig::Disk { path } => Arc::new(DiskStore::open(path).await?),
        };
        Self::with_store(config, store, Arc::new(SystemClock)).await
    }

    /// Build the cache over an existing store, rebuilding the L2 index from
    /// the store's entries. Expired entries are deleted and the oldest are
    /// evicted until the byte budget holds.
    pub async fn with_store(
        config: CacheConfig,
        store: Arc<dyn SliceStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, MdiError> {
        config.validate()?;
        let now = clock.now_ms();

        let mut entries = store.entries().await?;
        entries.sort_by_key(|e| (e.stored_at_ms, e.key.clone()));

        let mut l2 = LruIndex::new();
        let mut l2_bytes = 0;
        let mut expired = 0;
        for entry in entries {
            if entry.expires_at_ms <= now {
                store.delete(&entry.key).await?;
                expired += 1;
                continue;
            }
            l2_bytes += entry.size_bytes;
            l2.insert(
                entry.key,
                L2Meta {
                    size_bytes: entry.size_bytes,
                    expires_at_ms: entry.expires_at_ms,
                    last_access_ms: entry.stored_at_ms,
                },
            );
        }

        let mut evicted = 0;
        while l2_bytes > config.l2_max_bytes {
            let Some((key, meta)) = l2.pop_lru() else {
                break;
            };
            store.delete(&key).await?;
            l2_bytes -= meta.size_bytes;
            evicted += 1;
        }

        if l2.len() > 0 || expired > 0 || evicted > 0 {
            info!(
                entries = l2.len(),
                bytes = l2_bytes,
                expired,
                evicted,
                "L2 index rebuilt"
            );
        }

        let inner = Inner {
            l1: LruIndex::new(),
            l2,
            l2_bytes,
            prefetch: PrefetchQueue::new(config.prefetch_count, config.history_len),
            stats: CacheStats {
                l2_expired: expired,
                l2_evictions: evicted,
                ..CacheStats::default()
            },
        };

        Ok(Self {
            inner: Mutex::new(inner),
            store,
            clock,
            config,
            prefetch_ready: Notify::new(),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up a slice, L1 first, then L2 with promotion into L1.
    ///
    /// A miss is `Ok(None)`. The access is recorded for prefetch planning
    /// whether or not it hit.
    pub async fn get(&self, file_id: &str, slice_index: u32) -> Result<Option<SliceDataPayload>, MdiError> {
        let key = SliceKey::new(file_id, slice_index);
        let now = self.clock.now_ms();
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let found = match inner.l1.get(&key) {
            Some(entry) => {
                entry.last_access_ms = now;
                let slice = entry.slice.clone();
                inner.stats.l1.hit();
                Some(slice)
            }
            None => {
                inner.stats.l1.miss();
                self.lookup_l2(inner, &key, now).await?
            }
        };

        if found.is_some() {
            inner.stats.overall.hit();
        } else {
            inner.stats.overall.miss();
        }

        self.plan_prefetch(inner, &key);
        Ok(found)
    }

    async fn lookup_l2(
        &self,
        inner: &mut Inner,
        key: &SliceKey,
        now: u64,
    ) -> Result<Option<SliceDataPayload>, MdiError> {
        let Some(meta) = inner.l2.peek(key).copied() else {
            inner.stats.l2.miss();
            return Ok(None);
        };
        if meta.expires_at_ms <= now {
            debug!(%key, "L2 entry expired");
            self.drop_l2(inner, key).await?;
            inner.stats.l2_expired += 1;
            inner.stats.l2.miss();
            return Ok(None);
        }

        let stored = match self.store.get(key).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                warn!(%key, "L2 index entry missing from store");
                Self::forget_l2(inner, key);
                inner.stats.l2.miss();
                return Ok(None);
            }
            Err(e @ StorageError::Corrupt(_)) => {
                warn!(%key, "dropping corrupt L2 entry: {e}");
                self.drop_l2(inner, key).await?;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(meta) = inner.l2.get(key) {
            meta.last_access_ms = now;
        }
        inner.stats.l2.hit();
        self.insert_l1(inner, key.clone(), stored.slice.clone(), now);
        Ok(Some(stored.slice))
    }

    /// Insert a freshly fetched slice into both tiers.
    ///
    /// A slice larger than the whole L2 budget is kept in L1 only.
    pub async fn put(&self, slice: SliceDataPayload) -> Result<(), MdiError> {
        let key = SliceKey::new(slice.file_id.clone(), slice.slice_index);
        let size = slice.size_bytes() as u64;
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock().await;

        inner.prefetch.remove(&key);
        self.insert_l1(&mut inner, key.clone(), slice.clone(), now);

        if inner.l2.contains(&key) {
            Self::forget_l2(&mut inner, &key);
        }
        if size > self.config.l2_max_bytes {
            debug!(%key, size, budget = self.config.l2_max_bytes, "slice exceeds L2 budget; L1 only");
            self.store.delete(&key).await?;
            return Ok(());
        }

        while inner.l2_bytes + size > self.config.l2_max_bytes {
            let Some((victim, meta)) = inner.l2.pop_lru() else {
                break;
            };
            inner.l2_bytes -= meta.size_bytes;
            inner.stats.l2_evictions += 1;
            debug!(key = %victim, size = meta.size_bytes, "L2 eviction");
            self.store.delete(&victim).await?;
        }

        let expires_at_ms = now.saturating_add(self.config.l2_ttl_ms);
        let stored = StoredSlice {
            slice,
            stored_at_ms: now,
            expires_at_ms,
        };
        if let Err(e) = self.store.put(&key, stored).await {
            // The index no longer tracks the key; the store must not either.
            if let Err(del) = self.store.delete(&key).await {
                warn!(%key, "failed to drop stale L2 record: {del}");
            }
            return Err(e.into());
        }
        inner.l2.insert(
            key,
            L2Meta {
                size_bytes: size,
                expires_at_ms,
                last_access_ms: now,
            },
        );
        inner.l2_bytes += size;
        Ok(())
    }

    fn insert_l1(&self, inner: &mut Inner, key: SliceKey, slice: SliceDataPayload, now: u64) {
        let entry = L1Entry {
            slice,
            last_access_ms: now,
        };
        if inner.l1.insert(key, entry).is_some() {
            return;
        }
        while inner.l1.len() > self.config.l1_max_entries {
            if let Some((victim, _)) = inner.l1.pop_lru() {
                inner.stats.l1_evictions += 1;
                debug!(key = %victim, "L1 eviction");
            }
        }
    }

    /// Remove from the L2 index only.
    fn forget_l2(inner: &mut Inner, key: &SliceKey) {
        if let Some(meta) = inner.l2.remove(key) {
            inner.l2_bytes -= meta.size_bytes;
        }
    }

    async fn drop_l2(&self, inner: &mut Inner, key: &SliceKey) -> Result<(), MdiError> {
        Self::forget_l2(inner, key);
        self.store.delete(key).await?;
        Ok(())
    }

    fn plan_prefetch(&self, inner: &mut Inner, key: &SliceKey) {
        if !inner.prefetch.enabled() {
            return;
        }
        match inner.prefetch.record_access(key) {
            Pattern::Unknown => {}
            Pattern::Random => {
                inner.prefetch.drop_file(&key.file_id);
            }
            Pattern::Sequential(direction) => {
                inner.prefetch.drop_file(&key.file_id);
                let mut queued = 0;
                for (candidate, priority) in inner.prefetch.plan(key, direction) {
                    if inner.l1.contains(&candidate) || inner.l2.contains(&candidate) {
                        continue;
                    }
                    if inner.prefetch.push(candidate, priority) {
                        queued += 1;
                    }
                }
                if queued > 0 {
                    debug!(%key, ?direction, queued, "prefetch planned");
                    self.prefetch_ready.notify_one();
                }
            }
        }
    }

    pub async fn delete(&self, file_id: &str, slice_index: u32) -> Result<bool, MdiError> {
        let key = SliceKey::new(file_id, slice_index);
        let mut inner = self.inner.lock().await;
        inner.prefetch.remove(&key);
        let in_l1 = inner.l1.remove(&key).is_some();
        let in_l2 = inner.l2.contains(&key);
        self.drop_l2(&mut inner, &key).await?;
        Ok(in_l1 || in_l2)
    }

    /// Empty both tiers and the prefetch queue. Statistics are kept.
    pub async fn clear(&self) -> Result<(), MdiError> {
        let mut inner = self.inner.lock().await;
        inner.l1.clear();
        inner.l2.clear();
        inner.l2_bytes = 0;
        inner.prefetch.clear();
        self.store.clear().await?;
        info!("slice cache cleared");
        Ok(())
    }

    /// Drop every slice of `file_id` from both tiers, along with its access
    /// history and queued prefetches. Returns the number of slices removed.
    pub async fn invalidate_file(&self, file_id: &str) -> Result<usize, MdiError> {
        let mut inner = self.inner.lock().await;
        inner.prefetch.forget_file(file_id);

        let l1_keys = inner.l1.keys_where(|k, _| k.file_id == file_id);
        let l2_keys = inner.l2.keys_where(|k, _| k.file_id == file_id);
        for key in &l1_keys {
            inner.l1.remove(key);
        }
        let mut removed = l1_keys.len();
        for key in &l2_keys {
            if !l1_keys.contains(key) {
                removed += 1;
            }
            self.drop_l2(&mut inner, key).await?;
        }
        debug!(file_id, removed, "file invalidated");
        Ok(removed)
    }

    /// Delete every expired L2 entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<usize, MdiError> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock().await;
        let expired = inner.l2.keys_where(|_, meta| meta.expires_at_ms <= now);
        for key in &expired {
            self.drop_l2(&mut inner, key).await?;
        }
        inner.stats.l2_expired += expired.len() as u64;
        if !expired.is_empty() {
            debug!(count = expired.len(), "purged expired L2 entries");
        }
        Ok(expired.len())
    }

    /// Bound forward prefetch for `file_id` to `slice_count` slices.
    pub async fn register_volume(&self, file_id: &str, slice_count: u32) {
        self.inner.lock().await.prefetch.register_volume(file_id, slice_count);
    }

    /// Pop the most urgent queued prefetch whose slice is still uncached.
    pub async fn next_prefetch(&self) -> Option<PrefetchRequest> {
        let mut inner = self.inner.lock().await;
        while let Some(request) = inner.prefetch.pop() {
            if !inner.l1.contains(&request.key) && !inner.l2.contains(&request.key) {
                return Some(request);
            }
        }
        None
    }

    pub async fn prefetch_len(&self) -> usize {
        self.inner.lock().await.prefetch.len()
    }

    /// Resolves once prefetch work has been queued since the last wakeup.
    pub async fn prefetch_ready(&self) {
        self.prefetch_ready.notified().await;
    }

    pub async fn contains(&self, file_id: &str, slice_index: u32) -> bool {
        let key = SliceKey::new(file_id, slice_index);
        let inner = self.inner.lock().await;
        inner.l1.contains(&key) || inner.l2.contains(&key)
    }

    pub async fn entry_info(&self, file_id: &str, slice_index: u32) -> Option<EntryInfo> {
        let key = SliceKey::new(file_id, slice_index);
        let inner = self.inner.lock().await;
        if let Some(entry) = inner.l1.peek(&key) {
            return Some(EntryInfo {
                tier: Tier::L1,
                size_bytes: entry.slice.size_bytes() as u64,
                access_count: inner.l1.access_count(&key).unwrap_or(0),
                last_access_ms: entry.last_access_ms,
                expires_at_ms: inner.l2.peek(&key).map(|m| m.expires_at_ms),
            });
        }
        inner.l2.peek(&key).map(|meta| EntryInfo {
            tier: Tier::L2,
            size_bytes: meta.size_bytes,
            access_count: inner.l2.access_count(&key).unwrap_or(0),
            last_access_ms: meta.last_access_ms,
            expires_at_ms: Some(meta.expires_at_ms),
        })
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        CacheStats {
            l1_entries: inner.l1.len(),
            l2_entries: inner.l2.len(),
            l2_bytes: inner.l2_bytes,
            prefetch_queued: inner.prefetch.len(),
            ..inner.stats.clone()
        }
    }

    /// Usage and quota reported by the L2 store.
    pub async fn estimate(&self) -> Result<StorageEstimate, MdiError> {
        Ok(self.store.estimate().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::protocol::PixelBuffer;
    use std::time::Duration;

    fn slice(file_id: &str, index: u32, pixels: usize) -> SliceDataPayload {
        SliceDataPayload {
            file_id: file_id.into(),
            slice_index: index,
            width: pixels as u32,
            height: 1,
            min_value: 0.0,
            max_value: 255.0,
            window_center: 128.0,
            window_width: 256.0,
            data: PixelBuffer::from_values(&vec![7u8; pixels]),
        }
    }

    fn config() -> CacheConfig {
        CacheConfig {
            l1_max_entries: 3,
            l2_max_bytes: 100,
            l2_ttl_ms: 1_000,
            ..CacheConfig::default()
        }
    }

    async fn cache_with(config: CacheConfig) -> (SliceCache, Arc<MemoryStore>, ManualClock) {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(10_000);
        let cache = SliceCache::with_store(config, store.clone(), Arc::new(clock.clone()))
            .await
            .unwrap();
        (cache, store, clock)
    }

    #[test]
    fn key_display() {
        assert_eq!(SliceKey::new("ct-chest", 42).to_string(), "ct-chest:42");
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let (cache, _, _) = cache_with(config()).await;
        assert!(cache.get("vol", 1).await.unwrap().is_none());

        cache.put(slice("vol", 1, 10)).await.unwrap();
        let got = cache.get("vol", 1).await.unwrap().unwrap();
        assert_eq!(got.slice_index, 1);

        let stats = cache.stats().await;
        assert_eq!(stats.overall, TierStats { hits: 1, misses: 1 });
        assert_eq!(stats.l1.hits, 1);
        assert_eq!(stats.l2_entries, 1);
        assert_eq!(stats.l2_bytes, 10);
    }

    #[tokio::test]
    async fn l1_evicts_least_recently_used() {
        let (cache, _, _) = cache_with(config()).await;
        for i in 0..3 {
            cache.put(slice("vol", i, 1)).await.unwrap();
        }
        cache.get("vol", 0).await.unwrap();
        cache.put(slice("vol", 3, 1)).await.unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.l1_entries, 3);
        assert_eq!(stats.l1_evictions, 1);
        assert_eq!(cache.entry_info("vol", 1).await.unwrap().tier, Tier::L2);
        assert_eq!(cache.entry_info("vol", 0).await.unwrap().tier, Tier::L1);
    }

    #[tokio::test]
    async fn l2_hit_promotes_into_l1() {
        let (cache, _, _) = cache_with(config()).await;
        for i in 0..4 {
            cache.put(slice("vol", i, 1)).await.unwrap();
        }
        assert_eq!(cache.entry_info("vol", 0).await.unwrap().tier, Tier::L2);

        assert!(cache.get("vol", 0).await.unwrap().is_some());
        let stats = cache.stats().await;
        assert_eq!(stats.l1, TierStats { hits: 0, misses: 1 });
        assert_eq!(stats.l2, TierStats { hits: 1, misses: 0 });
        assert_eq!(cache.entry_info("vol", 0).await.unwrap().tier, Tier::L1);
    }

    #[tokio::test]
    async fn l2_evicts_by_bytes() {
        let (cache, store, _) = cache_with(config()).await;
        cache.put(slice("vol", 0, 40)).await.unwrap();
        cache.put(slice("vol", 1, 40)).await.unwrap();
        cache.put(slice("vol", 2, 40)).await.unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.l2_bytes, 80);
        assert_eq!(stats.l2_evictions, 1);
        assert!(store.get(&SliceKey::new("vol", 0)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_slice_stays_in_l1() {
        let (cache, store, _) = cache_with(config()).await;
        cache.put(slice("vol", 0, 40)).await.unwrap();
        cache.put(slice("vol", 9, 500)).await.unwrap();

        assert_eq!(cache.entry_info("vol", 9).await.unwrap().expires_at_ms, None);
        assert_eq!(cache.stats().await.l2_bytes, 40);
        assert_eq!(store.entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_l2_entry_is_a_miss() {
        let (cache, store, clock) = cache_with(config()).await;
        for i in 0..4 {
            cache.put(slice("vol", i, 1)).await.unwrap();
        }
        clock.advance(Duration::from_millis(1_000));

        assert!(cache.get("vol", 0).await.unwrap().is_none());
        assert!(store.get(&SliceKey::new("vol", 0)).await.unwrap().is_none());
        assert_eq!(cache.stats().await.l2_expired, 1);
    }

    #[tokio::test]
    async fn purge_removes_only_expired() {
        let (cache, _, clock) = cache_with(config()).await;
        cache.put(slice("vol", 0, 1)).await.unwrap();
        clock.advance(Duration::from_millis(600));
        cache.put(slice("vol", 1, 1)).await.unwrap();
        clock.advance(Duration::from_millis(600));

        assert_eq!(cache.purge_expired().await.unwrap(), 1);
        let stats = cache.stats().await;
        assert_eq!(stats.l2_entries, 1);
        assert_eq!(stats.l2_bytes, 1);
    }

    #[tokio::test]
    async fn sequential_scan_queues_next_five() {
        let (cache, _, _) = cache_with(CacheConfig::default()).await;
        for i in [10, 11, 12] {
            cache.get("vol", i).await.unwrap();
        }

        let mut queued = Vec::new();
        while let Some(req) = cache.next_prefetch().await {
            queued.push((req.key.slice_index, req.priority));
        }
        assert_eq!(queued, vec![(13, 5), (14, 4), (15, 3), (16, 2), (17, 1)]);
    }

    #[tokio::test]
    async fn backward_scan_stops_at_zero() {
        let (cache, _, _) = cache_with(CacheConfig::default()).await;
        cache.get("vol", 3).await.unwrap();
        cache.get("vol", 2).await.unwrap();

        let mut queued = Vec::new();
        while let Some(req) = cache.next_prefetch().await {
            queued.push(req.key.slice_index);
        }
        assert_eq!(queued, vec![1, 0]);
    }

    #[tokio::test]
    async fn prefetch_skips_cached_and_respects_volume() {
        let (cache, _, _) = cache_with(CacheConfig::default()).await;
        cache.register_volume("vol", 16).await;
        cache.put(slice("vol", 13, 1)).await.unwrap();
        cache.get("vol", 11).await.unwrap();
        cache.get("vol", 12).await.unwrap();

        let mut queued = Vec::new();
        while let Some(req) = cache.next_prefetch().await {
            queued.push(req.key.slice_index);
        }
        assert_eq!(queued, vec![14, 15]);
    }

    #[tokio::test]
    async fn random_access_drops_queued_prefetch() {
        let (cache, _, _) = cache_with(CacheConfig::default()).await;
        cache.get("vol", 10).await.unwrap();
        cache.get("vol", 11).await.unwrap();
        assert_eq!(cache.prefetch_len().await, 5);

        cache.get("vol", 40).await.unwrap();
        assert_eq!(cache.prefetch_len().await, 0);
    }

    #[tokio::test]
    async fn prefetch_ready_wakes_after_planning() {
        let (cache, _, _) = cache_with(CacheConfig::default()).await;
        cache.get("vol", 0).await.unwrap();
        cache.get("vol", 1).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), cache.prefetch_ready())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn invalidate_and_delete() {
        let (cache, _, _) = cache_with(config()).await;
        for i in 0..4 {
            cache.put(slice("a", i, 1)).await.unwrap();
        }
        cache.put(slice("b", 0, 1)).await.unwrap();

        assert_eq!(cache.invalidate_file("a").await.unwrap(), 4);
        assert!(!cache.contains("a", 0).await);
        assert!(cache.contains("b", 0).await);

        assert!(cache.delete("b", 0).await.unwrap());
        assert!(!cache.delete("b", 0).await.unwrap());
        assert_eq!(cache.stats().await.l2_bytes, 0);
    }

    #[tokio::test]
    async fn clear_keeps_statistics() {
        let (cache, store, _) = cache_with(config()).await;
        cache.put(slice("vol", 0, 1)).await.unwrap();
        cache.get("vol", 0).await.unwrap();
        cache.clear().await.unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.l1_entries + stats.l2_entries, 0);
        assert_eq!(stats.overall.hits, 1);
        assert!(store.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn index_rebuilds_from_store() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(5_000);
        {
            let cache = SliceCache::with_store(config(), store.clone(), Arc::new(clock.clone()))
                .await
                .unwrap();
            cache.put(slice("vol", 0, 30)).await.unwrap();
            clock.advance(Duration::from_millis(500));
            cache.put(slice("vol", 1, 30)).await.unwrap();
        }
        clock.advance(Duration::from_millis(600));

        let cache = SliceCache::with_store(config(), store.clone(), Arc::new(clock.clone()))
            .await
            .unwrap();
        let stats = cache.stats().await;
        assert_eq!(stats.l2_entries, 1);
        assert_eq!(stats.l2_expired, 1);
        assert!(cache.get("vol", 1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn storage_fault_surfaces_as_cache_storage() {
        let store = Arc::new(MemoryStore::with_quota(5));
        let cache = SliceCache::with_store(config(), store, Arc::new(ManualClock::new(0)))
            .await
            .unwrap();
        let err = cache.put(slice("vol", 0, 10)).await.unwrap_err();
        assert!(matches!(
            err,
            MdiError::CacheStorage(StorageError::QuotaExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn failed_replace_leaves_store_and_index_agreeing() {
        let store = Arc::new(MemoryStore::with_quota(15));
        let cache = SliceCache::with_store(config(), store.clone(), Arc::new(ManualClock::new(0)))
            .await
            .unwrap();
        cache.put(slice("vol", 0, 10)).await.unwrap();
        assert_eq!(cache.stats().await.l2_bytes, 10);

        let err = cache.put(slice("vol", 0, 20)).await.unwrap_err();
        assert!(matches!(err, MdiError::CacheStorage(StorageError::QuotaExceeded { .. })));

        let stats = cache.stats().await;
        assert_eq!((stats.l2_entries, stats.l2_bytes), (0, 0));
        assert_eq!(cache.estimate().await.unwrap().usage, 0);
        // The fresh copy is still served from L1.
        assert_eq!(cache.get("vol", 0).await.unwrap(), Some(slice("vol", 0, 20)));
    }

    #[tokio::test]
    async fn disk_backed_cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            storage: StorageConfig::Disk {
                path: dir.path().to_path_buf(),
            },
            ..CacheConfig::default()
        };
        {
            let cache = SliceCache::open(config.clone()).await.unwrap();
            cache.put(slice("vol", 4, 64)).await.unwrap();
        }
        let cache = SliceCache::open(config).await.unwrap();
        let got = cache.get("vol", 4).await.unwrap().unwrap();
        assert_eq!(got, slice("vol", 4, 64));
        assert_eq!(cache.stats().await.l2.hits, 1);
    }
}
