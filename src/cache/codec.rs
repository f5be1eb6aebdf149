//! Disk-tier record codec.
//!
//! One record per cache key, holding the payload and its bookkeeping:
//!
//! ```text
//! { key, data, etag, cached_at, last_accessed, max_age_ms, access_count }
//! ```
//!
//! Records are JSON. When compression is enabled the JSON is zstd-compressed
//! and prefixed with [`ZSTD_MAGIC`]; decoding accepts both forms, so toggling
//! the setting never orphans existing records.

use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::entry::CacheEntry;
use crate::cache::policy::CacheKey;
use crate::clock::Timestamp;
use crate::config::CodecConfig;

/// Prefix marking a zstd-compressed record.
pub const ZSTD_MAGIC: &[u8; 4] = b"FCZ1";

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Zstd failed: {0}")]
    Zstd(#[from] std::io::Error),

    #[error("Record JSON is invalid: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Record belongs to {found:?}, expected {expected:?}")]
    KeyMismatch { expected: String, found: String },
}

#[derive(Serialize, Deserialize)]
struct DiskRecord<T> {
    key: String,
    data: T,
    etag: Option<String>,
    cached_at: Timestamp,
    last_accessed: Timestamp,
    max_age_ms: u64,
    access_count: u64,
}

/// Record header without the payload, for inspection tools that do not know
/// the payload type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMeta {
    pub key: String,
    pub etag: Option<String>,
    pub cached_at: Timestamp,
    pub last_accessed: Timestamp,
    pub max_age_ms: u64,
    pub access_count: u64,
}

impl RecordMeta {
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }
}

pub struct RecordCodec {
    config: CodecConfig,
}

impl RecordCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    /// Serialize an entry for the blob store.
    pub fn encode<T: Serialize>(
        &self,
        key: &CacheKey,
        entry: &CacheEntry<T>,
    ) -> Result<Bytes, CodecError> {
        let record = DiskRecord {
            key: key.storage_key(),
            data: &entry.data,
            etag: entry.etag.clone(),
            cached_at: entry.cached_at,
            last_accessed: entry.last_accessed,
            max_age_ms: entry.max_age.as_millis() as u64,
            access_count: entry.access_count,
        };
        let json = serde_json::to_vec(&record)?;

        if !self.config.zstd_compression {
            return Ok(Bytes::from(json));
        }

        let compressed = zstd::encode_all(json.as_slice(), self.config.zstd_level)?;
        let mut out = Vec::with_capacity(ZSTD_MAGIC.len() + compressed.len());
        out.extend_from_slice(ZSTD_MAGIC);
        out.extend_from_slice(&compressed);
        Ok(Bytes::from(out))
    }

    /// Deserialize a record, checking it belongs to `key`.
    pub fn decode<T: DeserializeOwned>(
        &self,
        key: &CacheKey,
        raw: &[u8],
    ) -> Result<CacheEntry<T>, CodecError> {
        let json = self.unwrap_json(raw)?;
        let record: DiskRecord<T> = serde_json::from_slice(&json)?;

        let expected = key.storage_key();
        if record.key != expected {
            return Err(CodecError::KeyMismatch {
                expected,
                found: record.key,
            });
        }

        Ok(CacheEntry {
            data: record.data,
            etag: record.etag,
            cached_at: record.cached_at,
            last_accessed: record.last_accessed.max(record.cached_at),
            access_count: record.access_count,
            max_age: Duration::from_millis(record.max_age_ms),
        })
    }

    /// Decode only the header fields of a record.
    pub fn decode_meta(&self, raw: &[u8]) -> Result<RecordMeta, CodecError> {
        let json = self.unwrap_json(raw)?;
        Ok(serde_json::from_slice(&json)?)
    }

    fn unwrap_json(&self, raw: &[u8]) -> Result<Vec<u8>, CodecError> {
        match raw.strip_prefix(ZSTD_MAGIC.as_slice()) {
            Some(compressed) => Ok(zstd::decode_all(compressed)?),
            None => Ok(raw.to_vec()),
        }
    }
}
