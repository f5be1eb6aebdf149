//! Cache entries and freshness.
//!
//! A [`CacheEntry`] wraps an opaque payload with the bookkeeping the cache
//! needs: when it was fetched, how often and how recently it was read, and the
//! origin's ETag. Freshness is a pure function of those timestamps and the
//! entry's `max_age`; nothing here performs I/O.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;

/// Fraction of `max_age` after which an entry should be refreshed.
pub const REFRESH_THRESHOLD: f64 = 0.8;

/// Where an entry sits in its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Freshness {
    /// Younger than the refresh threshold.
    Fresh,
    /// Past the refresh threshold but not yet expired. Still served.
    Stale,
    /// Older than `max_age`.
    Expired,
}

impl Freshness {
    /// Whether the entry may be served without a synchronous fetch.
    pub fn is_usable(&self) -> bool {
        !matches!(self, Freshness::Expired)
    }
}

impl std::fmt::Display for Freshness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Freshness::Fresh => write!(f, "fresh"),
            Freshness::Stale => write!(f, "stale"),
            Freshness::Expired => write!(f, "expired"),
        }
    }
}

/// A single cached value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    /// Cached payload.
    pub data: T,

    /// Origin-supplied validator.
    pub etag: Option<String>,

    /// When the payload was fetched (ms since epoch).
    pub cached_at: Timestamp,

    /// Last read (ms since epoch). Never earlier than `cached_at`.
    pub last_accessed: Timestamp,

    /// Reads since the payload was fetched.
    pub access_count: u64,

    /// Lifetime of the payload.
    pub max_age: Duration,
}

impl<T> CacheEntry<T> {
    /// A freshly fetched entry.
    pub fn new(data: T, etag: Option<String>, max_age: Duration, now: Timestamp) -> Self {
        Self {
            data,
            etag,
            cached_at: now,
            last_accessed: now,
            access_count: 0,
            max_age,
        }
    }

    /// Time since the payload was fetched. Clock skew backwards reads as zero.
    pub fn age(&self, now: Timestamp) -> Duration {
        Duration::from_millis(now.saturating_sub(self.cached_at))
    }

    /// `now - cached_at > max_age`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.age(now) > self.max_age
    }

    /// `now - cached_at ≥ 0.8 × max_age`. Inclusive, so an entry read exactly
    /// at the threshold is already queued for refresh.
    pub fn should_refresh(&self, now: Timestamp) -> bool {
        self.age(now) >= self.max_age.mul_f64(REFRESH_THRESHOLD)
    }

    pub fn freshness(&self, now: Timestamp) -> Freshness {
        if self.is_expired(now) {
            Freshness::Expired
        } else if self.should_refresh(now) {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }

    /// Record a read, returning the updated entry.
    pub fn touch(mut self, now: Timestamp) -> Self {
        self.record_access(now);
        self
    }

    /// In-place form of [`CacheEntry::touch`], for entries owned by a map.
    pub fn record_access(&mut self, now: Timestamp) {
        self.last_accessed = now.max(self.cached_at).max(self.last_accessed);
        self.access_count = self.access_count.saturating_add(1);
    }

    /// Replace the payload wholesale, resetting access statistics.
    pub fn refreshed(self, data: T, etag: Option<String>, now: Timestamp) -> Self {
        Self::new(data, etag, self.max_age, now)
    }

    /// Map the payload, keeping the bookkeeping.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheEntry<U> {
        CacheEntry {
            data: f(self.data),
            etag: self.etag,
            cached_at: self.cached_at,
            last_accessed: self.last_accessed,
            access_count: self.access_count,
            max_age: self.max_age,
        }
    }
}

/// Freshness of `entry` at `now`.
pub fn freshness<T>(entry: &CacheEntry<T>, now: Timestamp) -> Freshness {
    entry.freshness(now)
}
