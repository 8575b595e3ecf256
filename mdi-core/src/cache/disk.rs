//! Directory-backed L2 store.
//!
//! One file per entry. The file name is the blake3 hash of the cache key;
//! the contents are a bincode record whose `frame` field holds the slice
//! encoded as a complete MDI frame, so a flipped bit on disk fails the
//! frame CRC on read instead of yielding bad pixels.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::SliceKey;
use crate::cache::store::{SliceStore, StorageEstimate, StoreEntry, StoredSlice};
use crate::codec::MdiCodec;
use crate::error::StorageError;
use crate::protocol::Message;

const EXTENSION: &str = "slice";

#[derive(Debug, Serialize, Deserialize)]
struct DiskRecord {
    file_id: String,
    slice_index: u32,
    stored_at_ms: u64,
    expires_at_ms: u64,
    size_bytes: u64,
    frame: Vec<u8>,
}

impl DiskRecord {
    fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        Ok(bincode::serialize(self)?)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn key(&self) -> SliceKey {
        SliceKey::new(self.file_id.clone(), self.slice_index)
    }
}

#[derive(Debug)]
pub struct DiskStore {
    dir: PathBuf,
    codec: MdiCodec,
    quota: Option<u64>,
}

impl DiskStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "disk store opened");
        Ok(Self {
            dir,
            codec: MdiCodec::new(),
            quota: None,
        })
    }

    pub fn with_quota(mut self, quota: u64) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &SliceKey) -> PathBuf {
        let hash = blake3::hash(key.to_string().as_bytes());
        self.dir.join(format!("{}.{EXTENSION}", hash.to_hex()))
    }

    async fn read_record(path: &Path) -> Result<Option<DiskRecord>, StorageError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => DiskRecord::from_bytes(&bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn entry_files(&self) -> Result<Vec<PathBuf>, StorageError> {
        let mut files = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == EXTENSION) {
                files.push(path);
            }
        }
        Ok(files)
    }

    async fn usage(&self) -> Result<u64, StorageError> {
        let mut usage = 0;
        for path in self.entry_files().await? {
            match tokio::fs::metadata(&path).await {
                Ok(meta) => usage += meta.len(),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(usage)
    }
}

#[async_trait]
impl SliceStore for DiskStore {
    async fn get(&self, key: &SliceKey) -> Result<Option<StoredSlice>, StorageError> {
        let Some(record) = Self::read_record(&self.path_for(key)).await? else {
            return Ok(None);
        };
        if record.key() != *key {
            return Ok(None);
        }

        let frame = self
            .codec
            .decode_frame(record.frame.into())
            .map_err(|e| StorageError::Corrupt(format!("{key}: {e}")))?;
        match frame.message {
            Message::SliceData(slice) => Ok(Some(StoredSlice {
                slice,
                stored_at_ms: record.stored_at_ms,
                expires_at_ms: record.expires_at_ms,
            })),
            other => Err(StorageError::Corrupt(format!(
                "{key}: expected SLICE_DATA, found {}",
                other.message_type()
            ))),
        }
    }

    async fn put(&self, key: &SliceKey, value: StoredSlice) -> Result<(), StorageError> {
        let frame = self
            .codec
            .encode_slice(&value.slice, 0)
            .map_err(|e| StorageError::Corrupt(format!("{key}: {e}")))?;
        let record = DiskRecord {
            file_id: key.file_id.clone(),
            slice_index: key.slice_index,
            stored_at_ms: value.stored_at_ms,
            expires_at_ms: value.expires_at_ms,
            size_bytes: value.size_bytes(),
            frame: frame.to_vec(),
        };
        let bytes = record.to_bytes()?;

        if let Some(quota) = self.quota {
            let current = self.usage().await?;
            let needed = bytes.len() as u64;
            if current + needed > quota {
                return Err(StorageError::QuotaExceeded {
                    needed,
                    available: quota.saturating_sub(current),
                });
            }
        }

        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &SliceKey) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> Result<(), StorageError> {
        for path in self.entry_files().await? {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<StoreEntry>, StorageError> {
        let mut entries = Vec::new();
        for path in self.entry_files().await? {
            match Self::read_record(&path).await {
                Ok(Some(record)) => entries.push(StoreEntry {
                    key: record.key(),
                    size_bytes: record.size_bytes,
                    stored_at_ms: record.stored_at_ms,
                    expires_at_ms: record.expires_at_ms,
                }),
                Ok(None) => {}
                Err(e) => {
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => warn!(path = %path.display(), "removed unreadable cache file: {e}"),
                        Err(rm) => warn!(
                            path = %path.display(),
                            "skipping unreadable cache file: {e}; removal failed: {rm}"
                        ),
                    }
                }
            }
        }
        Ok(entries)
    }

    async fn estimate(&self) -> Result<StorageEstimate, StorageError> {
        Ok(StorageEstimate {
            usage: self.usage().await?,
            quota: self.quota,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PixelBuffer, SliceDataPayload};

    fn stored(index: u32) -> StoredSlice {
        StoredSlice {
            slice: SliceDataPayload {
                file_id: "ct-chest".into(),
                slice_index: index,
                width: 4,
                height: 4,
                min_value: -1024.0,
                max_value: 3071.0,
                window_center: 40.0,
                window_width: 400.0,
                data: PixelBuffer::from_values(&[-1024i16; 16]),
            },
            stored_at_ms: 1_000,
            expires_at_ms: 2_000,
        }
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        let key = SliceKey::new("ct-chest", 3);

        store.put(&key, stored(3)).await.unwrap();
        let got = store.get(&key).await.unwrap().unwrap();
        assert_eq!(got, stored(3));
        assert!(store.get(&SliceKey::new("ct-chest", 4)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DiskStore::open(dir.path()).await.unwrap();
            store.put(&SliceKey::new("ct-chest", 1), stored(1)).await.unwrap();
            store.put(&SliceKey::new("ct-chest", 2), stored(2)).await.unwrap();
        }
        let store = DiskStore::open(dir.path()).await.unwrap();
        let mut entries = store.entries().await.unwrap();
        entries.sort_by_key(|e| e.key.slice_index);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, SliceKey::new("ct-chest", 1));
        assert_eq!(entries[0].size_bytes, 32);
        assert_eq!(entries[0].expires_at_ms, 2_000);
    }

    #[tokio::test]
    async fn corrupted_frame_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        let key = SliceKey::new("ct-chest", 5);
        store.put(&key, stored(5)).await.unwrap();

        let path = store.path_for(&key);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let err = store.get(&key).await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt(_)));
    }

    #[tokio::test]
    async fn unreadable_files_are_removed_on_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        let good = SliceKey::new("ct-chest", 1);
        let bad = SliceKey::new("ct-chest", 2);
        store.put(&good, stored(1)).await.unwrap();
        std::fs::write(store.path_for(&bad), b"junk").unwrap();

        let entries = store.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, good);
        assert!(!store.path_for(&bad).exists());
    }

    #[tokio::test]
    async fn clear_and_estimate() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        store.put(&SliceKey::new("ct-chest", 1), stored(1)).await.unwrap();
        assert!(store.estimate().await.unwrap().usage > 32);

        store.clear().await.unwrap();
        assert_eq!(store.estimate().await.unwrap().usage, 0);
        assert!(store.entries().await.unwrap().is_empty());
        store.delete(&SliceKey::new("ct-chest", 1)).await.unwrap();
    }
}
