//! Smart preloader: turns observed navigation into speculative prefetch.
//!
//! Screen transitions feed the [`NavigationGraph`]. `prefetch(screen)` warms
//! the top predictions for `screen` in parallel, skipping screens that are
//! already being warmed. Hit/miss feedback from the caller gives a running
//! accuracy figure.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::PredictorConfig;
use crate::predict::graph::NavigationGraph;
use crate::predict::warmer::{ScreenWarmer, WarmError, WarmReport};

type WarmTask = JoinHandle<(String, Result<WarmReport, WarmError>)>;

/// Prefetch work started by one [`SmartPreloader::prefetch`] call.
///
/// The warm tasks are detached: dropping the batch does not cancel them, and
/// each still clears its screen from the in-flight set when it finishes.
pub struct PrefetchBatch {
    pub id: Uuid,
    /// Screens this batch is warming, in prediction order.
    pub screens: Vec<String>,
    tasks: Vec<WarmTask>,
}

impl PrefetchBatch {
    pub fn is_empty(&self) -> bool {
        self.screens.is_empty()
    }

    /// Wait for every screen in the batch to finish warming.
    pub async fn wait(self) -> Vec<(String, Result<WarmReport, WarmError>)> {
        let mut results = Vec::with_capacity(self.screens.len());
        for task in self.tasks {
            match task.await {
                Ok(result) => results.push(result),
                Err(e) => warn!(batch = %self.id, "Prefetch task panicked: {e}"),
            }
        }
        results
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct PreloaderStats {
    pub hits: u64,
    pub misses: u64,
    /// Percentage of correct predictions, 0 with no samples.
    pub accuracy: f64,
    pub tracked_screens: usize,
    pub prefetching: usize,
}

pub struct SmartPreloader {
    config: PredictorConfig,
    graph: RwLock<NavigationGraph>,
    warmer: Arc<dyn ScreenWarmer>,
    prefetching: Arc<Mutex<HashSet<String>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    clock: SharedClock,
}

impl SmartPreloader {
    pub fn new(config: PredictorConfig, warmer: Arc<dyn ScreenWarmer>, clock: SharedClock) -> Self {
        Self {
            graph: RwLock::new(NavigationGraph::new(config.clone())),
            config,
            warmer,
            prefetching: Arc::new(Mutex::new(HashSet::new())),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            clock,
        }
    }

    /// Record a transition to `screen`.
    pub async fn track_navigation(&self, screen: &str) {
        let now = self.clock.now();
        let updated = self.graph.write().await.track(screen, now);
        debug!(screen, updated = ?updated, "Tracked navigation");
    }

    /// Predicted next screens for `screen`, best first.
    pub async fn predictions(&self, screen: &str) -> Vec<String> {
        self.graph.read().await.predictions(screen).to_vec()
    }

    /// Warm up to `limit` predicted screens for `screen`.
    ///
    /// Must be called within a tokio runtime. Screens already being warmed by
    /// an earlier batch are skipped.
    pub async fn prefetch(&self, screen: &str, limit: usize) -> PrefetchBatch {
        let candidates = self.predictions(screen).await;
        let mut batch = PrefetchBatch {
            id: Uuid::new_v4(),
            screens: Vec::new(),
            tasks: Vec::new(),
        };

        let mut prefetching = self.prefetching.lock().await;
        for candidate in candidates.into_iter().take(limit) {
            if !prefetching.insert(candidate.clone()) {
                debug!(screen = %candidate, "Already prefetching");
                continue;
            }
            batch.screens.push(candidate.clone());

            let warmer = self.warmer.clone();
            let in_flight = self.prefetching.clone();
            batch.tasks.push(tokio::spawn(async move {
                let result = warmer.warm(&candidate).await;
                in_flight.lock().await.remove(&candidate);
                match &result {
                    Ok(report) => debug!(
                        screen = %candidate,
                        fetched = report.fetched,
                        cached = report.cached,
                        "Prefetched screen"
                    ),
                    Err(e) => warn!(screen = %candidate, "Prefetch failed: {e}"),
                }
                (candidate, result)
            }));
        }
        drop(prefetching);

        if !batch.is_empty() {
            info!(batch = %batch.id, from = screen, screens = batch.screens.len(), "Prefetch started");
        }
        batch
    }

    /// [`SmartPreloader::prefetch`] with the configured limit.
    pub async fn prefetch_default(&self, screen: &str) -> PrefetchBatch {
        self.prefetch(screen, self.config.prefetch_limit).await
    }

    pub async fn is_prefetching(&self, screen: &str) -> bool {
        self.prefetching.lock().await.contains(screen)
    }

    /// The user went to a screen that was predicted.
    pub fn record_hit(&self, screen: &str) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!(screen, "Prediction hit");
    }

    /// The user went to a screen that was not predicted.
    pub fn record_miss(&self, screen: &str) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(screen, "Prediction miss");
    }

    /// `hits / (hits + misses) * 100`, or 0 before any feedback.
    pub fn accuracy(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64 * 100.0
    }

    /// Forget screens idle for longer than the retention window.
    pub async fn purge_stale(&self) -> usize {
        let now = self.clock.now();
        let purged = self.graph.write().await.purge(now);
        if purged > 0 {
            info!(purged, "Purged idle screens from navigation graph");
        }
        purged
    }

    pub async fn stats(&self) -> PreloaderStats {
        PreloaderStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            accuracy: self.accuracy(),
            tracked_screens: self.graph.read().await.len(),
            prefetching: self.prefetching.lock().await.len(),
        }
    }

    /// Start the periodic retention purge.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let preloader = self.clone();
        let period = self.config.maintenance_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                preloader.purge_stale().await;
            }
        })
    }
}
