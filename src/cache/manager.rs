//! Cache manager: orchestrates the memory and disk tiers.
//!
//! The manager is the central coordinator for cached data. It:
//! - Serves reads from memory, then disk, then the origin fetcher
//! - Schedules background refreshes for entries past the refresh threshold
//! - Evicts from the memory tier when a policy tag reaches `max_entries`
//! - Revalidates entries by ETag
//! - Sweeps expired entries from both tiers
//! - Falls back to expired data when the origin fails
//!
//! A manager is a cheap `Clone` handle; clones share the same tiers. No lock
//! is held across a call into a fetcher or the blob store, so a foreground
//! fetch and a background refresh of the same key may race. The last writer
//! wins, which is harmless because both write a complete fresh entry.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::codec::RecordCodec;
use crate::cache::entry::{CacheEntry, Freshness};
use crate::cache::evictor::Evictor;
use crate::cache::policy::{CacheKey, CachePolicy, PolicyTable, PolicyTag};
use crate::cache::refresh::RefreshQueue;
use crate::cache::CacheError;
use crate::clock::{SharedClock, Timestamp};
use crate::config::CacheConfig;
use crate::fetch::SharedFetcher;
use crate::store::SharedBlobStore;

/// Payload types the manager can hold.
pub trait Cacheable: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Cacheable for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Which tier answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Memory,
    Disk,
    Origin,
    /// The origin failed and an expired entry was served instead.
    StaleFallback,
}

/// Result of a lookup with its provenance.
#[derive(Debug, Clone)]
pub struct Lookup<T> {
    pub value: T,
    pub source: Source,
    pub freshness: Freshness,
    pub etag: Option<String>,
}

impl<T> Lookup<T> {
    fn new(entry: CacheEntry<T>, source: Source, freshness: Freshness) -> Self {
        Self {
            value: entry.data,
            source,
            freshness,
            etag: entry.etag,
        }
    }
}

/// Per-call options for [`CacheManager::get`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Skip both tiers and go to the origin. Cached data is still used if the
    /// origin fails.
    pub force_refresh: bool,

    /// Lifetime for the stored entry instead of the tag policy's `max_age`.
    pub max_age: Option<Duration>,
}

impl GetOptions {
    pub fn force_refresh() -> Self {
        Self {
            force_refresh: true,
            ..Default::default()
        }
    }

    pub fn with_max_age(max_age: Duration) -> Self {
        Self {
            max_age: Some(max_age),
            ..Default::default()
        }
    }
}

/// Result of [`CacheManager::check_etag_and_fetch`].
#[derive(Debug, Clone, PartialEq)]
pub enum EtagOutcome<T> {
    /// The cached ETag matched; the fetcher was not called.
    NotModified(T),
    /// New data was fetched and cached.
    Modified(T),
    /// The fetch failed; cached data with a different ETag was served.
    Stale(T),
}

impl<T> EtagOutcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            EtagOutcome::NotModified(v) | EtagOutcome::Modified(v) | EtagOutcome::Stale(v) => v,
        }
    }
}

/// Notifications published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CacheEvent {
    Stored { key: String },
    Evicted { tag: String, keys: Vec<String> },
    RefreshScheduled { key: String },
    RefreshCompleted { key: String },
    RefreshFailed { key: String, error: String },
    StaleServed { key: String },
    Invalidated { key: String },
    Swept { memory: usize, disk: usize },
}

/// Outcome of one background refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed(CacheKey),
    Failed(CacheKey),
}

/// Result of an expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub memory_removed: usize,
    pub disk_removed: usize,
    /// Unreadable disk records (also counted in `disk_removed`).
    pub disk_corrupt: usize,
}

/// One disk-tier record as seen by inspection tools.
#[derive(Debug, Clone, Serialize)]
pub struct DiskRecordInfo {
    pub key: String,
    pub etag: Option<String>,
    pub age_secs: u64,
    pub max_age_secs: u64,
    pub access_count: u64,
    pub size: usize,
    pub freshness: Freshness,
}

#[derive(Debug, Default)]
struct Counters {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
    fetch_failures: AtomicU64,
    stale_fallbacks: AtomicU64,
    decode_failures: AtomicU64,
    evictions: AtomicU64,
    refreshes_completed: AtomicU64,
    refreshes_failed: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// Point-in-time statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub fetch_failures: u64,
    pub stale_fallbacks: u64,
    pub decode_failures: u64,
    pub evictions: u64,
    pub refreshes_completed: u64,
    pub refreshes_failed: u64,
    pub refresh_pending: usize,
    /// Memory-tier entries per policy tag.
    pub entries: BTreeMap<String, usize>,
}

impl CacheStats {
    /// Fraction of lookups answered without the origin.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.memory_hits + self.disk_hits;
        let total = hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    pub fn total_entries(&self) -> usize {
        self.entries.values().sum()
    }
}

type MemoryTier<T> = HashMap<PolicyTag, HashMap<String, CacheEntry<T>>>;

enum MemoryLookup<T> {
    Hit(CacheEntry<T>, Freshness),
    Expired(CacheEntry<T>),
    Miss,
}

struct Inner<T> {
    memory: RwLock<MemoryTier<T>>,
    store: SharedBlobStore,
    codec: RecordCodec,
    evictor: Evictor,
    policies: PolicyTable,
    refresh: RefreshQueue<T>,
    refresh_delay: Duration,
    sweep_interval: Duration,
    clock: SharedClock,
    counters: Counters,
    events: broadcast::Sender<CacheEvent>,
}

/// The two-tier cache.
pub struct CacheManager<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for CacheManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Cacheable> CacheManager<T> {
    /// Create a manager over `store` using `config`'s policies.
    pub fn new(config: &CacheConfig, store: SharedBlobStore, clock: SharedClock) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                memory: RwLock::new(HashMap::new()),
                store,
                codec: RecordCodec::new(config.codec.clone()),
                evictor: Evictor::new(config.eviction.clone()),
                policies: config.policies.clone(),
                refresh: RefreshQueue::new(),
                refresh_delay: config.refresh_delay(),
                sweep_interval: config.sweep_interval(),
                clock,
                counters: Counters::default(),
                events,
            }),
        }
    }

    /// The policy applied to `tag`.
    pub fn policy(&self, tag: &PolicyTag) -> CachePolicy {
        self.inner.policies.get(tag)
    }

    /// Subscribe to cache events.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Read `key`, fetching from the origin on a miss.
    pub async fn get(
        &self,
        key: &CacheKey,
        fetcher: SharedFetcher<T>,
        opts: GetOptions,
    ) -> Result<T, CacheError> {
        Ok(self.get_with_source(key, fetcher, opts).await?.value)
    }

    /// [`CacheManager::get`], also reporting which tier answered.
    pub async fn get_with_source(
        &self,
        key: &CacheKey,
        fetcher: SharedFetcher<T>,
        opts: GetOptions,
    ) -> Result<Lookup<T>, CacheError> {
        let mut policy = self.policy(&key.tag);
        if let Some(max_age) = opts.max_age {
            policy.max_age = max_age;
        }
        let now = self.inner.clock.now();
        let mut fallback: Option<CacheEntry<T>> = None;

        if opts.force_refresh {
            fallback = self.peek(key).await;
        } else {
            match self.lookup_memory(key, now).await {
                MemoryLookup::Hit(entry, freshness) => {
                    bump(&self.inner.counters.memory_hits, 1);
                    if freshness == Freshness::Stale && policy.stale_while_revalidate {
                        self.schedule_refresh(key.clone(), fetcher).await;
                    }
                    return Ok(Lookup::new(entry, Source::Memory, freshness));
                }
                MemoryLookup::Expired(entry) => fallback = Some(entry),
                MemoryLookup::Miss => {}
            }

            match self.read_disk(key).await {
                Ok(Some(entry)) => {
                    let freshness = entry.freshness(now);
                    if freshness.is_usable() {
                        bump(&self.inner.counters.disk_hits, 1);
                        let entry = entry.touch(now);
                        self.insert_memory(key, entry.clone(), &policy).await;
                        if freshness == Freshness::Stale && policy.stale_while_revalidate {
                            self.schedule_refresh(key.clone(), fetcher).await;
                        }
                        debug!(key = %key, %freshness, "Promoted disk entry into memory");
                        return Ok(Lookup::new(entry, Source::Disk, freshness));
                    }
                    fallback = newest(fallback, entry);
                }
                Ok(None) => {}
                Err(e) => warn!(key = %key, "Disk tier read failed: {e}"),
            }
        }

        bump(&self.inner.counters.misses, 1);
        match fetcher.fetch().await {
            Ok(fetched) => {
                let entry = CacheEntry::new(
                    fetched.data,
                    fetched.etag,
                    policy.max_age,
                    self.inner.clock.now(),
                );
                self.store_entry(key, entry.clone(), &policy).await;
                Ok(Lookup::new(entry, Source::Origin, Freshness::Fresh))
            }
            Err(e) => {
                bump(&self.inner.counters.fetch_failures, 1);
                match fallback {
                    Some(entry) => {
                        bump(&self.inner.counters.stale_fallbacks, 1);
                        warn!(key = %key, kind = %e.kind, "Origin failed, serving cached copy: {e}");
                        self.emit(CacheEvent::StaleServed {
                            key: key.to_string(),
                        });
                        let freshness = entry.freshness(now);
                        Ok(Lookup::new(entry, Source::StaleFallback, freshness))
                    }
                    None => Err(CacheError::Fetch {
                        key: key.clone(),
                        source: e,
                    }),
                }
            }
        }
    }

    /// Populate `key` unless a usable copy is already cached.
    ///
    /// A memory hit is not counted as a read: hit counters and the entry's
    /// access stats are left alone so warming does not skew eviction.
    pub async fn prefetch(
        &self,
        key: &CacheKey,
        fetcher: SharedFetcher<T>,
    ) -> Result<Source, CacheError> {
        if let Some(entry) = self.peek(key).await {
            let freshness = entry.freshness(self.inner.clock.now());
            if freshness.is_usable() {
                if freshness == Freshness::Stale && self.policy(&key.tag).stale_while_revalidate {
                    self.schedule_refresh(key.clone(), fetcher).await;
                }
                return Ok(Source::Memory);
            }
        }
        Ok(self
            .get_with_source(key, fetcher, GetOptions::default())
            .await?
            .source)
    }

    /// Revalidate `key` against the origin's current ETag.
    ///
    /// If the cached entry carries `current_etag`, its data is returned and
    /// `fetcher` is not called. Otherwise fresh data is fetched and cached.
    pub async fn check_etag_and_fetch(
        &self,
        key: &CacheKey,
        current_etag: &str,
        fetcher: SharedFetcher<T>,
    ) -> Result<EtagOutcome<T>, CacheError> {
        let now = self.inner.clock.now();
        let cached = match self.peek(key).await {
            Some(entry) => Some(entry),
            None => self.read_disk(key).await.unwrap_or_else(|e| {
                warn!(key = %key, "Disk tier read failed: {e}");
                None
            }),
        };

        if let Some(entry) = &cached {
            if entry.etag.as_deref() == Some(current_etag) {
                debug!(key = %key, etag = current_etag, "ETag unchanged");
                self.touch_memory(key, now).await;
                return Ok(EtagOutcome::NotModified(entry.data.clone()));
            }
        }

        let policy = self.policy(&key.tag);
        match fetcher.fetch().await {
            Ok(fetched) => {
                let entry = CacheEntry::new(
                    fetched.data,
                    fetched.etag,
                    policy.max_age,
                    self.inner.clock.now(),
                );
                let data = entry.data.clone();
                self.store_entry(key, entry, &policy).await;
                Ok(EtagOutcome::Modified(data))
            }
            Err(e) => {
                bump(&self.inner.counters.fetch_failures, 1);
                match cached {
                    Some(entry) => {
                        bump(&self.inner.counters.stale_fallbacks, 1);
                        warn!(key = %key, "Revalidation fetch failed, serving cached copy: {e}");
                        Ok(EtagOutcome::Stale(entry.data))
                    }
                    None => Err(CacheError::Fetch {
                        key: key.clone(),
                        source: e,
                    }),
                }
            }
        }
    }

    /// Store a value directly, as if just fetched.
    pub async fn put(&self, key: &CacheKey, data: T, etag: Option<String>) {
        let policy = self.policy(&key.tag);
        let entry = CacheEntry::new(data, etag, policy.max_age, self.inner.clock.now());
        self.store_entry(key, entry, &policy).await;
    }

    /// The memory-tier entry for `key`, without access bookkeeping.
    pub async fn peek(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
        self.inner
            .memory
            .read()
            .await
            .get(&key.tag)
            .and_then(|m| m.get(&key.key))
            .cloned()
    }

    /// Memory-tier entries across all tags.
    pub async fn len(&self) -> usize {
        self.inner.memory.read().await.values().map(HashMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Memory-tier entries for one tag.
    pub async fn len_for(&self, tag: &PolicyTag) -> usize {
        self.inner
            .memory
            .read()
            .await
            .get(tag)
            .map_or(0, HashMap::len)
    }

    /// Remove `key` from both tiers and drop any pending refresh.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let removed = self
            .inner
            .memory
            .write()
            .await
            .get_mut(&key.tag)
            .and_then(|m| m.remove(&key.key))
            .is_some();
        self.inner.refresh.cancel(key).await;
        self.inner.store.delete(&key.storage_key()).await?;

        debug!(key = %key, "Invalidated");
        self.emit(CacheEvent::Invalidated {
            key: key.to_string(),
        });
        Ok(removed)
    }

    /// Remove every entry of `tag` from both tiers. Returns distinct keys removed.
    pub async fn invalidate_tag(&self, tag: &PolicyTag) -> Result<usize, CacheError> {
        let mut removed: HashSet<String> = self
            .inner
            .memory
            .write()
            .await
            .remove(tag)
            .map(|m| m.into_keys().collect())
            .unwrap_or_default();

        for storage_key in self.inner.store.list().await? {
            let Some(key) = CacheKey::from_storage_key(&storage_key) else {
                continue;
            };
            if &key.tag != tag {
                continue;
            }
            self.inner.store.delete(&storage_key).await?;
            removed.insert(key.key);
        }

        for key in self.inner.refresh.pending().await {
            if &key.tag == tag {
                self.inner.refresh.cancel(&key).await;
            }
        }

        info!(tag = %tag, removed = removed.len(), "Invalidated tag");
        self.emit(CacheEvent::Invalidated {
            key: format!("{tag}/*"),
        });
        Ok(removed.len())
    }

    /// Empty both tiers and the refresh queue.
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.inner.memory.write().await.clear();
        self.inner.refresh.clear().await;
        for storage_key in self.inner.store.list().await? {
            if CacheKey::from_storage_key(&storage_key).is_some() {
                self.inner.store.delete(&storage_key).await?;
            }
        }
        info!("Cache cleared");
        Ok(())
    }

    /// Run one eviction round for `tag` if it is at its limit. Returns the
    /// number of entries evicted.
    pub async fn evict(&self, tag: &PolicyTag) -> usize {
        let policy = self.policy(tag);
        let evicted = {
            let mut memory = self.inner.memory.write().await;
            match memory.get_mut(tag) {
                Some(tag_map) => self.evict_locked(tag_map, &policy),
                None => Vec::new(),
            }
        };
        let n = evicted.len();
        self.report_eviction(tag, evicted);
        n
    }

    /// Remove expired entries from both tiers.
    pub async fn sweep_expired(&self) -> Result<SweepReport, CacheError> {
        let now = self.inner.clock.now();
        let mut report = SweepReport::default();

        {
            let mut memory = self.inner.memory.write().await;
            for tag_map in memory.values_mut() {
                let before = tag_map.len();
                tag_map.retain(|_, entry| !entry.is_expired(now));
                report.memory_removed += before - tag_map.len();
            }
            memory.retain(|_, tag_map| !tag_map.is_empty());
        }

        for storage_key in self.inner.store.list().await? {
            if CacheKey::from_storage_key(&storage_key).is_none() {
                continue;
            }
            let raw = match self.inner.store.get(&storage_key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %storage_key, "Sweep could not read record: {e}");
                    continue;
                }
            };
            let expired = match self.inner.codec.decode_meta(&raw) {
                Ok(meta) => now.saturating_sub(meta.cached_at) > meta.max_age_ms,
                Err(e) => {
                    warn!(key = %storage_key, "Sweeping unreadable record: {e}");
                    report.disk_corrupt += 1;
                    true
                }
            };
            if !expired {
                continue;
            }
            match self.inner.store.delete(&storage_key).await {
                Ok(()) => report.disk_removed += 1,
                Err(e) => warn!(key = %storage_key, "Sweep could not delete record: {e}"),
            }
        }

        if report.memory_removed + report.disk_removed > 0 {
            info!(
                memory = report.memory_removed,
                disk = report.disk_removed,
                corrupt = report.disk_corrupt,
                "Expiry sweep complete"
            );
            self.emit(CacheEvent::Swept {
                memory: report.memory_removed,
                disk: report.disk_removed,
            });
        }
        Ok(report)
    }

    /// Describe every disk-tier record.
    pub async fn disk_index(&self) -> Result<Vec<DiskRecordInfo>, CacheError> {
        let now = self.inner.clock.now();
        let mut records = Vec::new();
        for storage_key in self.inner.store.list().await? {
            let Some(raw) = self.inner.store.get(&storage_key).await? else {
                continue;
            };
            let meta = match self.inner.codec.decode_meta(&raw) {
                Ok(meta) => meta,
                Err(e) => {
                    debug!(key = %storage_key, "Skipping unreadable record: {e}");
                    continue;
                }
            };
            let shape = CacheEntry {
                data: (),
                etag: None,
                cached_at: meta.cached_at,
                last_accessed: meta.last_accessed,
                access_count: meta.access_count,
                max_age: meta.max_age(),
            };
            records.push(DiskRecordInfo {
                key: meta.key,
                etag: meta.etag,
                age_secs: shape.age(now).as_secs(),
                max_age_secs: shape.max_age.as_secs(),
                access_count: meta.access_count,
                size: raw.len(),
                freshness: shape.freshness(now),
            });
        }
        Ok(records)
    }

    pub async fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        let entries = self
            .inner
            .memory
            .read()
            .await
            .iter()
            .map(|(tag, m)| (tag.to_string(), m.len()))
            .collect();

        CacheStats {
            memory_hits: c.memory_hits.load(Ordering::Relaxed),
            disk_hits: c.disk_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            fetch_failures: c.fetch_failures.load(Ordering::Relaxed),
            stale_fallbacks: c.stale_fallbacks.load(Ordering::Relaxed),
            decode_failures: c.decode_failures.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            refreshes_completed: c.refreshes_completed.load(Ordering::Relaxed),
            refreshes_failed: c.refreshes_failed.load(Ordering::Relaxed),
            refresh_pending: self.inner.refresh.len().await,
            entries,
        }
    }

    // ─── Background refresh ─────────────────────────────────────────────

    /// Queue a background refresh. Returns `false` if `key` was already queued.
    pub async fn schedule_refresh(&self, key: CacheKey, fetcher: SharedFetcher<T>) -> bool {
        let label = key.to_string();
        let queued = self.inner.refresh.schedule(key, fetcher).await;
        if queued {
            self.emit(CacheEvent::RefreshScheduled { key: label });
        }
        queued
    }

    /// Keys waiting for a background refresh, oldest first.
    pub async fn pending_refreshes(&self) -> Vec<CacheKey> {
        self.inner.refresh.pending().await
    }

    /// Run the oldest queued refresh. `None` when the queue is empty.
    ///
    /// A failed refresh is logged and dropped; the stale entry stays until it
    /// expires or the next read schedules another attempt.
    pub async fn refresh_next(&self) -> Option<RefreshOutcome> {
        let job = self.inner.refresh.pop().await?;
        let key = job.key;

        match job.fetcher.fetch().await {
            Ok(fetched) => {
                let mut policy = self.policy(&key.tag);
                if let Some(existing) = self.peek(&key).await {
                    policy.max_age = existing.max_age;
                }
                let entry = CacheEntry::new(
                    fetched.data,
                    fetched.etag,
                    policy.max_age,
                    self.inner.clock.now(),
                );
                self.store_entry(&key, entry, &policy).await;
                bump(&self.inner.counters.refreshes_completed, 1);
                debug!(key = %key, "Background refresh complete");
                self.emit(CacheEvent::RefreshCompleted {
                    key: key.to_string(),
                });
                Some(RefreshOutcome::Refreshed(key))
            }
            Err(e) => {
                bump(&self.inner.counters.refreshes_failed, 1);
                warn!(key = %key, kind = %e.kind, "Background refresh failed, dropping: {e}");
                self.emit(CacheEvent::RefreshFailed {
                    key: key.to_string(),
                    error: e.to_string(),
                });
                Some(RefreshOutcome::Failed(key))
            }
        }
    }

    /// Run every queued refresh now, without the inter-item delay.
    pub async fn drain_refresh_queue(&self) -> Vec<RefreshOutcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.refresh_next().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Start the single worker that drains the refresh queue, pausing
    /// `refresh_delay` between items.
    pub fn spawn_refresh_worker(&self) -> RefreshWorker {
        let manager = self.clone();
        let delay = self.inner.refresh_delay;
        let (shutdown, mut stop) = watch::channel(false);

        let handle = tokio::spawn(async move {
            info!(delay_ms = delay.as_millis() as u64, "Refresh worker started");
            'outer: loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = manager.inner.refresh.notified() => {}
                }
                while manager.refresh_next().await.is_some() {
                    tokio::select! {
                        _ = stop.changed() => break 'outer,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
            info!("Refresh worker stopped");
        });

        RefreshWorker {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Start the periodic expiry sweep.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let period = self.inner.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = manager.sweep_expired().await {
                    warn!("Expiry sweep failed: {e}");
                }
            }
        })
    }

    // ─── Internals ──────────────────────────────────────────────────────

    async fn lookup_memory(&self, key: &CacheKey, now: Timestamp) -> MemoryLookup<T> {
        let mut memory = self.inner.memory.write().await;
        let Some(entry) = memory.get_mut(&key.tag).and_then(|m| m.get_mut(&key.key)) else {
            return MemoryLookup::Miss;
        };
        let freshness = entry.freshness(now);
        if !freshness.is_usable() {
            return MemoryLookup::Expired(entry.clone());
        }
        entry.record_access(now);
        MemoryLookup::Hit(entry.clone(), freshness)
    }

    async fn touch_memory(&self, key: &CacheKey, now: Timestamp) {
        if let Some(entry) = self
            .inner
            .memory
            .write()
            .await
            .get_mut(&key.tag)
            .and_then(|m| m.get_mut(&key.key))
        {
            entry.record_access(now);
        }
    }

    /// Read and decode the disk record for `key`. Unreadable records are
    /// deleted and reported as absent.
    async fn read_disk(&self, key: &CacheKey) -> Result<Option<CacheEntry<T>>, CacheError> {
        let storage_key = key.storage_key();
        let Some(raw) = self.inner.store.get(&storage_key).await? else {
            return Ok(None);
        };

        match self.inner.codec.decode::<T>(key, &raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                bump(&self.inner.counters.decode_failures, 1);
                warn!(key = %key, "Discarding unreadable disk record: {e}");
                if let Err(e) = self.inner.store.delete(&storage_key).await {
                    warn!(key = %key, "Could not delete unreadable record: {e}");
                }
                Ok(None)
            }
        }
    }

    async fn write_disk(&self, key: &CacheKey, entry: &CacheEntry<T>) {
        let raw = match self.inner.codec.encode(key, entry) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %key, "Could not encode record: {e}");
                return;
            }
        };
        if let Err(e) = self.inner.store.put(&key.storage_key(), raw).await {
            warn!(key = %key, "Disk tier write failed: {e}");
        }
    }

    async fn store_entry(&self, key: &CacheKey, entry: CacheEntry<T>, policy: &CachePolicy) {
        self.write_disk(key, &entry).await;
        self.insert_memory(key, entry, policy).await;
        self.emit(CacheEvent::Stored {
            key: key.to_string(),
        });
    }

    async fn insert_memory(&self, key: &CacheKey, entry: CacheEntry<T>, policy: &CachePolicy) {
        let evicted = {
            let mut memory = self.inner.memory.write().await;
            let tag_map = memory.entry(key.tag.clone()).or_default();
            let evicted = if tag_map.contains_key(&key.key) {
                Vec::new()
            } else {
                self.evict_locked(tag_map, policy)
            };
            tag_map.insert(key.key.clone(), entry);
            evicted
        };
        self.report_eviction(&key.tag, evicted);
    }

    fn evict_locked(
        &self,
        tag_map: &mut HashMap<String, CacheEntry<T>>,
        policy: &CachePolicy,
    ) -> Vec<String> {
        let evictor = &self.inner.evictor;
        if !evictor.needs_eviction(tag_map.len(), policy.max_entries) {
            return Vec::new();
        }
        let count = evictor.batch_size(policy.max_entries);
        let victims = evictor.select_victims(tag_map.iter(), count);
        victims
            .into_iter()
            .filter_map(|victim| tag_map.remove(&victim.key).map(|_| victim.key))
            .collect()
    }

    fn report_eviction(&self, tag: &PolicyTag, keys: Vec<String>) {
        if keys.is_empty() {
            return;
        }
        bump(&self.inner.counters.evictions, keys.len() as u64);
        info!(tag = %tag, evicted = keys.len(), "Eviction round complete");
        self.emit(CacheEvent::Evicted {
            tag: tag.to_string(),
            keys,
        });
    }

    fn emit(&self, event: CacheEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

fn newest<T>(current: Option<CacheEntry<T>>, candidate: CacheEntry<T>) -> Option<CacheEntry<T>> {
    match current {
        Some(existing) if existing.cached_at >= candidate.cached_at => Some(existing),
        _ => Some(candidate),
    }
}

/// Handle to the background refresh worker. Dropping it stops the worker.
pub struct RefreshWorker {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl RefreshWorker {
    /// Stop after the refresh in flight (if any) and wait for the task.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for RefreshWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::clock::ManualClock;
    use crate::fetch::{fetcher_fn, FetchError, Fetched};
    use crate::store::{BlobStore, MemoryBlobStore};

    const MIN: Duration = Duration::from_secs(60);

    struct Harness {
        cache: CacheManager<String>,
        clock: Arc<ManualClock>,
        store: Arc<MemoryBlobStore>,
    }

    fn harness(config: CacheConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MemoryBlobStore::new());
        let cache = CacheManager::new(&config, store.clone(), clock.clone());
        Harness {
            cache,
            clock,
            store,
        }
    }

    fn counting(value: &'static str, calls: Arc<AtomicUsize>) -> SharedFetcher<String> {
        fetcher_fn(move || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Fetched::with_etag(value.to_string(), format!("etag-{value}")))
            }
        })
    }

    fn failing() -> SharedFetcher<String> {
        fetcher_fn(|| async { Err(FetchError::network("offline")) })
    }

    fn key(k: &str) -> CacheKey {
        CacheKey::new(PolicyTag::Videos, k)
    }

    #[tokio::test]
    async fn test_miss_then_memory_hit() {
        let h = harness(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let first = h
            .cache
            .get_with_source(&key("v1"), counting("a", calls.clone()), GetOptions::default())
            .await
            .unwrap();
        assert_eq!(first.source, Source::Origin);
        assert_eq!(first.etag.as_deref(), Some("etag-a"));

        let second = h
            .cache
            .get_with_source(&key("v1"), counting("b", calls.clone()), GetOptions::default())
            .await
            .unwrap();
        assert_eq!(second.source, Source::Memory);
        assert_eq!(second.value, "a");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.cache.peek(&key("v1")).await.unwrap().access_count, 1);
        assert_eq!(h.store.len().await, 1);
    }

    #[tokio::test]
    async fn test_stale_hit_schedules_one_refresh() {
        let h = harness(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        h.cache
            .get(&key("v1"), counting("a", calls.clone()), GetOptions::default())
            .await
            .unwrap();

        // Videos policy: 15 minutes, so 12 minutes is the refresh threshold.
        h.clock.advance(12 * MIN);
        for _ in 0..3 {
            let hit = h
                .cache
                .get_with_source(&key("v1"), counting("b", calls.clone()), GetOptions::default())
                .await
                .unwrap();
            assert_eq!(hit.source, Source::Memory);
            assert_eq!(hit.freshness, Freshness::Stale);
            assert_eq!(hit.value, "a");
        }
        assert_eq!(h.cache.pending_refreshes().await, vec![key("v1")]);

        let outcomes = h.cache.drain_refresh_queue().await;
        assert_eq!(outcomes, vec![RefreshOutcome::Refreshed(key("v1"))]);
        let entry = h.cache.peek(&key("v1")).await.unwrap();
        assert_eq!(entry.data, "b");
        assert_eq!(entry.access_count, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_refresh_without_stale_while_revalidate() {
        let h = harness(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let ads = CacheKey::new(PolicyTag::Ads, "slot-1");
        h.cache
            .get(&ads, counting("a", calls.clone()), GetOptions::default())
            .await
            .unwrap();

        h.clock.advance(9 * MIN);
        h.cache
            .get(&ads, counting("b", calls.clone()), GetOptions::default())
            .await
            .unwrap();
        assert!(h.cache.pending_refreshes().await.is_empty());
    }

    #[tokio::test]
    async fn test_expired_memory_falls_through_to_fetch() {
        let h = harness(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        h.cache
            .get(&key("v1"), counting("a", calls.clone()), GetOptions::default())
            .await
            .unwrap();

        h.clock.advance(16 * MIN);
        let got = h
            .cache
            .get_with_source(&key("v1"), counting("b", calls.clone()), GetOptions::default())
            .await
            .unwrap();
        assert_eq!(got.source, Source::Origin);
        assert_eq!(got.value, "b");
    }

    #[tokio::test]
    async fn test_expired_entry_served_when_origin_fails() {
        let h = harness(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        h.cache
            .get(&key("v1"), counting("a", calls), GetOptions::default())
            .await
            .unwrap();

        h.clock.advance(60 * MIN);
        let got = h
            .cache
            .get_with_source(&key("v1"), failing(), GetOptions::default())
            .await
            .unwrap();
        assert_eq!(got.source, Source::StaleFallback);
        assert_eq!(got.freshness, Freshness::Expired);
        assert_eq!(got.value, "a");
        assert_eq!(h.cache.stats().await.stale_fallbacks, 1);
    }

    #[tokio::test]
    async fn test_cold_miss_with_failing_origin_errors() {
        let h = harness(CacheConfig::default());
        let err = h
            .cache
            .get(&key("nothing"), failing(), GetOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Fetch { .. }));
    }

    #[tokio::test]
    async fn test_disk_promotion() {
        let h = harness(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        h.cache
            .get(&key("v1"), counting("a", calls.clone()), GetOptions::default())
            .await
            .unwrap();

        // A second manager over the same store starts with a cold memory tier.
        let other: CacheManager<String> =
            CacheManager::new(&CacheConfig::default(), h.store.clone(), h.clock.clone());
        let got = other
            .get_with_source(&key("v1"), counting("b", calls.clone()), GetOptions::default())
            .await
            .unwrap();
        assert_eq!(got.source, Source::Disk);
        assert_eq!(got.value, "a");
        assert_eq!(other.len().await, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_corrupt_disk_record_is_a_miss() {
        let h = harness(CacheConfig::default());
        h.store
            .put(&key("v1").storage_key(), bytes::Bytes::from_static(b"garbage"))
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let got = h
            .cache
            .get_with_source(&key("v1"), counting("a", calls), GetOptions::default())
            .await
            .unwrap();
        assert_eq!(got.source, Source::Origin);
        assert_eq!(h.cache.stats().await.decode_failures, 1);
    }

    #[tokio::test]
    async fn test_eviction_on_full_tag() {
        let mut config = CacheConfig::default();
        config
            .policies
            .set(&PolicyTag::Videos, CachePolicy::new(15 * MIN, 10, true));
        let h = harness(config);
        let calls = Arc::new(AtomicUsize::new(0));

        for i in 0..10 {
            h.cache
                .get(&key(&format!("v{i}")), counting("x", calls.clone()), GetOptions::default())
                .await
                .unwrap();
        }
        // Make v9 the hottest entry.
        for _ in 0..3 {
            h.cache
                .get(&key("v9"), counting("x", calls.clone()), GetOptions::default())
                .await
                .unwrap();
        }
        assert_eq!(h.cache.len_for(&PolicyTag::Videos).await, 10);

        h.cache
            .get(&key("v10"), counting("x", calls.clone()), GetOptions::default())
            .await
            .unwrap();
        assert_eq!(h.cache.len_for(&PolicyTag::Videos).await, 9);
        assert!(h.cache.peek(&key("v9")).await.is_some());
        assert!(h.cache.peek(&key("v10")).await.is_some());
        assert_eq!(h.cache.stats().await.evictions, 2);
    }

    #[tokio::test]
    async fn test_etag_short_circuit() {
        let h = harness(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        h.cache
            .get(&key("v1"), counting("a", calls.clone()), GetOptions::default())
            .await
            .unwrap();

        let outcome = h
            .cache
            .check_etag_and_fetch(&key("v1"), "etag-a", counting("b", calls.clone()))
            .await
            .unwrap();
        assert_eq!(outcome, EtagOutcome::NotModified("a".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let outcome = h
            .cache
            .check_etag_and_fetch(&key("v1"), "etag-b", counting("b", calls.clone()))
            .await
            .unwrap();
        assert_eq!(outcome, EtagOutcome::Modified("b".to_string()));
        assert_eq!(h.cache.peek(&key("v1")).await.unwrap().etag.as_deref(), Some("etag-b"));
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_from_both_tiers() {
        let h = harness(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        h.cache
            .get(&key("v1"), counting("a", calls.clone()), GetOptions::default())
            .await
            .unwrap();
        let profile = CacheKey::new(PolicyTag::UserProfile, "42");
        h.cache
            .get(&profile, counting("p", calls.clone()), GetOptions::default())
            .await
            .unwrap();

        // Videos expire after 15 minutes, profiles after 30.
        h.clock.advance(20 * MIN);
        let report = h.cache.sweep_expired().await.unwrap();
        assert_eq!(report.memory_removed, 1);
        assert_eq!(report.disk_removed, 1);
        assert!(h.cache.peek(&key("v1")).await.is_none());
        assert!(h.cache.peek(&profile).await.is_some());
        assert_eq!(h.store.len().await, 1);
    }

    #[tokio::test]
    async fn test_prefetch_of_cached_key_leaves_stats_alone() {
        let h = harness(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        h.cache
            .get(&key("v1"), counting("a", calls.clone()), GetOptions::default())
            .await
            .unwrap();
        let before = h.cache.stats().await;

        let source = h
            .cache
            .prefetch(&key("v1"), counting("b", calls.clone()))
            .await
            .unwrap();
        assert_eq!(source, Source::Memory);
        let after = h.cache.stats().await;
        assert_eq!(after.memory_hits, before.memory_hits);
        assert_eq!(after.misses, before.misses);
        assert_eq!(h.cache.peek(&key("v1")).await.unwrap().access_count, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A stale copy still counts as cached but queues a refresh.
        h.clock.advance(12 * MIN);
        let source = h
            .cache
            .prefetch(&key("v1"), counting("b", calls.clone()))
            .await
            .unwrap();
        assert_eq!(source, Source::Memory);
        assert_eq!(h.cache.pending_refreshes().await, vec![key("v1")]);
        assert_eq!(h.cache.stats().await.memory_hits, before.memory_hits);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_on_interval() {
        let h = harness(CacheConfig {
            sweep_interval_secs: 1,
            ..Default::default()
        });
        h.cache.put(&key("v1"), "a".to_string(), None).await;
        h.clock.advance(20 * MIN);

        let sweeper = h.cache.spawn_sweeper();
        // Nothing is swept on the immediate first tick.
        tokio::task::yield_now().await;
        assert!(h.cache.peek(&key("v1")).await.is_some());

        for _ in 0..10 {
            if h.cache.peek(&key("v1")).await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert!(h.cache.peek(&key("v1")).await.is_none());
        assert_eq!(h.store.len().await, 0);
        sweeper.abort();
    }

    #[tokio::test]
    async fn test_invalidate_tag() {
        let h = harness(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        for k in ["a", "b"] {
            h.cache
                .get(&key(k), counting("x", calls.clone()), GetOptions::default())
                .await
                .unwrap();
        }
        let profile = CacheKey::new(PolicyTag::UserProfile, "42");
        h.cache
            .get(&profile, counting("p", calls.clone()), GetOptions::default())
            .await
            .unwrap();

        assert_eq!(h.cache.invalidate_tag(&PolicyTag::Videos).await.unwrap(), 2);
        assert_eq!(h.cache.len().await, 1);
        assert_eq!(h.store.list().await.unwrap(), vec!["user_profile/42".to_string()]);
    }

    #[tokio::test]
    async fn test_events_published() {
        let h = harness(CacheConfig::default());
        let mut events = h.cache.subscribe();
        h.cache.put(&key("v1"), "a".to_string(), None).await;
        assert_eq!(
            events.recv().await.unwrap(),
            CacheEvent::Stored {
                key: "videos/v1".to_string()
            }
        );
    }
}
