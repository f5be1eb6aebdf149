//! Memory-tier eviction policy: decides which entries to drop when a policy
//! tag reaches its `max_entries`.
//!
//! The default order approximates LFU with a recency tie-break: entries are
//! ranked by `(access_count asc, last_accessed asc)` and the lowest fraction
//! (20% by default, rounded up) is dropped in one round. Plain LRU ordering is
//! available through [`EvictionOrder::Lru`].

use crate::cache::entry::CacheEntry;
use crate::clock::Timestamp;
use crate::config::{EvictionConfig, EvictionOrder};

/// An eviction candidate with the fields it is ranked by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub key: String,
    pub access_count: u64,
    pub last_accessed: Timestamp,
}

impl EvictionCandidate {
    fn rank(&self, order: EvictionOrder) -> (u64, u64) {
        match order {
            EvictionOrder::FrequencyThenRecency => (self.access_count, self.last_accessed),
            EvictionOrder::Lru => (self.last_accessed, self.access_count),
        }
    }
}

pub struct Evictor {
    config: EvictionConfig,
}

impl Evictor {
    pub fn new(config: EvictionConfig) -> Self {
        Self { config }
    }

    pub fn order(&self) -> EvictionOrder {
        self.config.order
    }

    /// Number of entries one round removes for a tag limited to `max_entries`.
    ///
    /// `ceil(fraction × max_entries)`, never less than one.
    pub fn batch_size(&self, max_entries: usize) -> usize {
        // Epsilon absorbs float noise such as 0.2 × 15 = 3.0000000000000004.
        let raw = (self.config.fraction * max_entries as f64 - 1e-9).ceil();
        (raw as usize).max(1)
    }

    /// Whether a tag holding `len` entries must evict before inserting.
    pub fn needs_eviction(&self, len: usize, max_entries: usize) -> bool {
        len >= max_entries
    }

    /// Pick up to `count` victims, most evictable first.
    pub fn select_victims<'a, T: 'a>(
        &self,
        entries: impl Iterator<Item = (&'a String, &'a CacheEntry<T>)>,
        count: usize,
    ) -> Vec<EvictionCandidate> {
        let order = self.config.order;
        let mut candidates: Vec<EvictionCandidate> = entries
            .map(|(key, entry)| EvictionCandidate {
                key: key.clone(),
                access_count: entry.access_count,
                last_accessed: entry.last_accessed,
            })
            .collect();

        // Key as a final tie-break keeps the choice deterministic.
        candidates.sort_by(|a, b| {
            a.rank(order)
                .cmp(&b.rank(order))
                .then_with(|| a.key.cmp(&b.key))
        });
        candidates.truncate(count);
        candidates
    }
}
