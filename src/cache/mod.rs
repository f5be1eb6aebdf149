//! Two-tier (memory + disk) cache with stale-while-revalidate.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`entry`]: CacheEntry and freshness computation
//! - [`policy`]: PolicyTag / CacheKey addressing and per-tag TTL policies
//! - [`evictor`]: Memory-tier eviction ordering (frequency + recency)
//! - [`codec`]: Disk record encoding with optional zstd
//! - [`refresh`]: Background refresh queue
//! - [`manager`]: Cache manager that orchestrates tiers, refresh and sweep

pub mod codec;
pub mod entry;
pub mod evictor;
pub mod manager;
pub mod policy;
pub mod refresh;

use thiserror::Error;

use crate::cache::codec::CodecError;
use crate::cache::policy::CacheKey;
use crate::fetch::FetchError;
use crate::store::StoreError;

pub use entry::{CacheEntry, Freshness};
pub use manager::{CacheManager, GetOptions, Lookup, Source};
pub use policy::{CachePolicy, PolicyTable, PolicyTag};

#[derive(Error, Debug)]
pub enum CacheError {
    /// Cold miss and the origin failed: nothing cached to fall back on.
    #[error("Fetch for {key} failed with nothing cached: {source}")]
    Fetch {
        key: CacheKey,
        #[source]
        source: FetchError,
    },

    #[error("Disk tier error: {0}")]
    Store(#[from] StoreError),

    #[error("Record codec error: {0}")]
    Codec(#[from] CodecError),
}
