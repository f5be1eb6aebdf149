//! Directory-backed blob store.
//!
//! Each key becomes one record file named by the SHA-256 of the key, so
//! arbitrarily long keys (feed URLs with cursors) fit in a file name. The key
//! itself is kept in a sidecar file next to the record for [`BlobStore::list`].
//! Files are spread across 256 shard directories by the digest's first byte:
//!
//! ```text
//! <root>/<digest[0]:02x>/<hex(digest)>.rec
//! <root>/<digest[0]:02x>/<hex(digest)>.key
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};

use super::{BlobStore, StoreError};

const RECORD_EXT: &str = "rec";
const KEY_EXT: &str = "key";

/// Async directory store.
pub struct FsBlobStore {
    root: PathBuf,
    stats: FsStoreStats,
}

#[derive(Debug, Default)]
pub struct FsStoreStats {
    pub total_writes: AtomicU64,
    pub total_reads: AtomicU64,
    pub total_bytes_written: AtomicU64,
    pub total_bytes_read: AtomicU64,
}

impl FsBlobStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            stats: FsStoreStats::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stats(&self) -> &FsStoreStats {
        &self.stats
    }

    /// Record path for `key`; the key sidecar shares its stem.
    fn blob_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        let digest = Sha256::digest(key.as_bytes());
        Ok(self
            .root
            .join(hex::encode(&digest[..1]))
            .join(format!("{}.{RECORD_EXT}", hex::encode(digest))))
    }

    /// Total record bytes on disk across all shards.
    pub async fn disk_usage(&self) -> Result<u64, StoreError> {
        let mut total = 0u64;
        let mut shards = fs::read_dir(&self.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.metadata().await?.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(shard.path()).await?;
            while let Some(file) = files.next_entry().await? {
                if !has_ext(&file.path(), RECORD_EXT) {
                    continue;
                }
                let meta = file.metadata().await?;
                if meta.is_file() {
                    total += meta.len();
                }
            }
        }
        Ok(total)
    }
}

fn has_ext(path: &Path, ext: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ext)
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let path = self.blob_path(key)?;
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        debug!(key, path = %path.display(), size = data.len(), "Read blob");
        self.stats.total_reads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes_read
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        Ok(Some(Bytes::from(data)))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        let path = self.blob_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Sidecar first: a record is never listed without its key.
        fs::write(path.with_extension(KEY_EXT), key.as_bytes()).await?;

        // Write to a sibling temp file then rename, so readers never see a torn record.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &path).await?;

        debug!(key, path = %path.display(), size = data.len(), "Wrote blob");
        self.stats.total_writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.blob_path(key)?;
        for target in [path.clone(), path.with_extension(KEY_EXT)] {
            match fs::remove_file(&target).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(key, path = %path.display(), "Deleted blob");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut shards = fs::read_dir(&self.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.metadata().await?.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(shard.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if !has_ext(&path, RECORD_EXT) {
                    continue;
                }
                match self.key_for_record(&path).await {
                    Ok(key) => keys.push(key),
                    Err(e) => warn!("Skipping foreign file in blob store: {e}"),
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

impl FsBlobStore {
    /// Read a record's key sidecar and check it hashes back to the record.
    async fn key_for_record(&self, record: &Path) -> Result<String, StoreError> {
        let bad = || StoreError::BadFileName(record.to_path_buf());
        let raw = match fs::read(record.with_extension(KEY_EXT)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(bad()),
            Err(e) => return Err(e.into()),
        };
        let key = String::from_utf8(raw).map_err(|_| bad())?;
        if self.blob_path(&key)? != record {
            return Err(bad());
        }
        Ok(key)
    }
}
