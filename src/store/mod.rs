//! Persistent blob storage for the disk tier.
//!
//! - [`fs`]: sharded directory store on top of tokio's async file I/O
//! - [`memory`]: in-process store used by tests and ephemeral caches

pub mod fs;
pub mod memory;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid blob key {0:?}")]
    InvalidKey(String),

    #[error("Unreadable blob file name: {0}")]
    BadFileName(PathBuf),
}

/// Key → bytes storage consumed by the cache's disk tier.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read a blob, `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Write (or overwrite) a blob.
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError>;

    /// Delete a blob. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// All keys currently stored.
    async fn list(&self) -> Result<Vec<String>, StoreError>;
}

/// Shared handle to a blob store.
pub type SharedBlobStore = Arc<dyn BlobStore>;
