//! Prometheus exposition of cache and predictor statistics.
//!
//! Values are copied from [`CacheStats`] / [`PreloaderStats`] snapshots at
//! scrape time, so every metric is a gauge.

use prometheus::{Encoder, Gauge, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::manager::CacheStats;
use crate::predict::PreloaderStats;

pub struct Metrics {
    registry: Registry,
    memory_hits: IntGauge,
    disk_hits: IntGauge,
    misses: IntGauge,
    fetch_failures: IntGauge,
    stale_fallbacks: IntGauge,
    decode_failures: IntGauge,
    evictions: IntGauge,
    refreshes_completed: IntGauge,
    refreshes_failed: IntGauge,
    refresh_pending: IntGauge,
    entries: IntGaugeVec,
    prediction_accuracy: Gauge,
    tracked_screens: IntGauge,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("feed_cache".to_string()), None)?;

        let gauge = |name: &str, help: &str| -> prometheus::Result<IntGauge> {
            let g = IntGauge::new(name, help)?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };

        let memory_hits = gauge("memory_hits", "Lookups answered by the memory tier")?;
        let disk_hits = gauge("disk_hits", "Lookups answered by the disk tier")?;
        let misses = gauge("misses", "Lookups that went to the origin")?;
        let fetch_failures = gauge("fetch_failures", "Origin fetches that failed")?;
        let stale_fallbacks = gauge("stale_fallbacks", "Expired entries served after an origin failure")?;
        let decode_failures = gauge("decode_failures", "Unreadable disk records discarded")?;
        let evictions = gauge("evictions", "Entries evicted from the memory tier")?;
        let refreshes_completed = gauge("refreshes_completed", "Background refreshes that succeeded")?;
        let refreshes_failed = gauge("refreshes_failed", "Background refreshes that failed")?;
        let refresh_pending = gauge("refresh_pending", "Keys waiting for a background refresh")?;
        let tracked_screens = gauge("tracked_screens", "Screens known to the navigation predictor")?;

        let entries = IntGaugeVec::new(
            Opts::new("memory_entries", "Memory-tier entries per policy tag"),
            &["tag"],
        )?;
        registry.register(Box::new(entries.clone()))?;

        let prediction_accuracy = Gauge::new(
            "prediction_accuracy_percent",
            "Share of navigations that were predicted",
        )?;
        registry.register(Box::new(prediction_accuracy.clone()))?;

        Ok(Self {
            registry,
            memory_hits,
            disk_hits,
            misses,
            fetch_failures,
            stale_fallbacks,
            decode_failures,
            evictions,
            refreshes_completed,
            refreshes_failed,
            refresh_pending,
            entries,
            prediction_accuracy,
            tracked_screens,
        })
    }

    /// Copy a snapshot into the gauges.
    pub fn observe(&self, cache: &CacheStats, predictor: &PreloaderStats) {
        let set = |g: &IntGauge, v: u64| g.set(v as i64);
        set(&self.memory_hits, cache.memory_hits);
        set(&self.disk_hits, cache.disk_hits);
        set(&self.misses, cache.misses);
        set(&self.fetch_failures, cache.fetch_failures);
        set(&self.stale_fallbacks, cache.stale_fallbacks);
        set(&self.decode_failures, cache.decode_failures);
        set(&self.evictions, cache.evictions);
        set(&self.refreshes_completed, cache.refreshes_completed);
        set(&self.refreshes_failed, cache.refreshes_failed);
        set(&self.refresh_pending, cache.refresh_pending as u64);
        set(&self.tracked_screens, predictor.tracked_screens as u64);

        self.entries.reset();
        for (tag, count) in &cache.entries {
            self.entries.with_label_values(&[tag.as_str()]).set(*count as i64);
        }
        self.prediction_accuracy.set(predictor.accuracy);
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
