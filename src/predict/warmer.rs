//! Screen warmers: what "prefetch a screen" means.
//!
//! The preloader only knows screen ids. A [`ScreenWarmer`] maps a screen to
//! the data it will need and populates the cache with it.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::cache::manager::Cacheable;
use crate::cache::policy::CacheKey;
use crate::cache::{CacheManager, Source};
use crate::fetch::SharedFetcher;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WarmError {
    #[error("Every resource of screen {screen} failed to load ({failed})")]
    AllFailed { screen: String, failed: usize },

    #[error("Warming {screen} failed: {message}")]
    Other { screen: String, message: String },
}

/// Outcome of warming one screen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmReport {
    /// Resources registered for the screen.
    pub resources: usize,
    /// Resources that had to be fetched from the origin.
    pub fetched: usize,
    /// Resources already cached.
    pub cached: usize,
    pub failed: usize,
}

#[async_trait]
pub trait ScreenWarmer: Send + Sync {
    /// Make the data for `screen` available ahead of navigation.
    async fn warm(&self, screen: &str) -> Result<WarmReport, WarmError>;
}

/// A warmer that does nothing, for predictors run without a data layer.
pub struct NoopWarmer;

#[async_trait]
impl ScreenWarmer for NoopWarmer {
    async fn warm(&self, _screen: &str) -> Result<WarmReport, WarmError> {
        Ok(WarmReport::default())
    }
}

/// Registry of per-screen resources, warmed through a [`CacheManager`].
pub struct CacheWarmer<T> {
    cache: CacheManager<T>,
    resources: RwLock<HashMap<String, Vec<(CacheKey, SharedFetcher<T>)>>>,
}

impl<T: Cacheable> CacheWarmer<T> {
    pub fn new(cache: CacheManager<T>) -> Self {
        Self {
            cache,
            resources: RwLock::new(HashMap::new()),
        }
    }

    /// Declare that `screen` needs `key`. Registering the same key twice
    /// replaces its fetcher.
    pub async fn register(&self, screen: &str, key: CacheKey, fetcher: SharedFetcher<T>) {
        let mut resources = self.resources.write().await;
        let list = resources.entry(screen.to_string()).or_default();
        match list.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = fetcher,
            None => list.push((key, fetcher)),
        }
    }

    pub async fn unregister(&self, screen: &str) -> bool {
        self.resources.write().await.remove(screen).is_some()
    }

    pub async fn keys_for(&self, screen: &str) -> Vec<CacheKey> {
        self.resources
            .read()
            .await
            .get(screen)
            .map(|list| list.iter().map(|(k, _)| k.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl<T: Cacheable> ScreenWarmer for CacheWarmer<T> {
    async fn warm(&self, screen: &str) -> Result<WarmReport, WarmError> {
        let resources = self
            .resources
            .read()
            .await
            .get(screen)
            .cloned()
            .unwrap_or_default();
        if resources.is_empty() {
            debug!(screen, "No resources registered");
            return Ok(WarmReport::default());
        }

        let results = join_all(
            resources
                .iter()
                .map(|(key, fetcher)| self.cache.prefetch(key, fetcher.clone())),
        )
        .await;

        let mut report = WarmReport {
            resources: resources.len(),
            ..Default::default()
        };
        for ((key, _), result) in resources.iter().zip(results) {
            match result {
                Ok(Source::Origin) => report.fetched += 1,
                Ok(Source::StaleFallback) => report.failed += 1,
                Ok(_) => report.cached += 1,
                Err(e) => {
                    warn!(screen, key = %key, "Prefetch failed: {e}");
                    report.failed += 1;
                }
            }
        }

        if report.failed == report.resources {
            return Err(WarmError::AllFailed {
                screen: screen.to_string(),
                failed: report.failed,
            });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cache::policy::PolicyTag;
    use crate::clock::ManualClock;
    use crate::config::CacheConfig;
    use crate::fetch::{fetcher_fn, FetchError, Fetched};
    use crate::store::MemoryBlobStore;

    fn cache() -> CacheManager<String> {
        CacheManager::new(
            &CacheConfig::default(),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(ManualClock::new(0)),
        )
    }

    #[tokio::test]
    async fn test_warm_populates_cache() {
        let cache = cache();
        let warmer = CacheWarmer::new(cache.clone());
        let feed = CacheKey::new(PolicyTag::Feed, "home");
        let profile = CacheKey::new(PolicyTag::UserProfile, "me");
        warmer
            .register("home", feed.clone(), fetcher_fn(|| async { Ok(Fetched::new("f".to_string())) }))
            .await;
        warmer
            .register("home", profile.clone(), fetcher_fn(|| async { Ok(Fetched::new("p".to_string())) }))
            .await;

        let report = warmer.warm("home").await.unwrap();
        assert_eq!(report.resources, 2);
        assert_eq!(report.fetched, 2);
        assert!(cache.peek(&feed).await.is_some());

        let again = warmer.warm("home").await.unwrap();
        assert_eq!(again.cached, 2);
    }

    #[tokio::test]
    async fn test_unknown_screen_is_a_noop() {
        let warmer = CacheWarmer::new(cache());
        assert_eq!(warmer.warm("nowhere").await.unwrap(), WarmReport::default());
    }

    #[tokio::test]
    async fn test_all_failed() {
        let warmer = CacheWarmer::new(cache());
        warmer
            .register(
                "ads",
                CacheKey::new(PolicyTag::Ads, "slot"),
                fetcher_fn(|| async { Err::<Fetched<String>, _>(FetchError::timeout("slow")) }),
            )
            .await;
        assert!(matches!(
            warmer.warm("ads").await,
            Err(WarmError::AllFailed { failed: 1, .. })
        ));
    }
}
