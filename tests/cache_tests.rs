//! Integration tests for the two-tier cache over a real directory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use feed_cache::cache::manager::{CacheEvent, EtagOutcome, RefreshOutcome};
use feed_cache::cache::policy::{CacheKey, CachePolicy, PolicyTag};
use feed_cache::cache::{CacheError, CacheManager, Freshness, GetOptions, Source};
use feed_cache::clock::ManualClock;
use feed_cache::config::CacheConfig;
use feed_cache::fetch::{fetcher_fn, FetchError, FetchErrorKind, Fetched, SharedFetcher};
use feed_cache::store::{BlobStore, FsBlobStore};

const MIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct Video {
    id: String,
    title: String,
    likes: u32,
}

fn video(id: &str, likes: u32) -> Video {
    Video {
        id: id.to_string(),
        title: format!("Video {id}"),
        likes,
    }
}

fn origin(likes: u32, calls: Arc<AtomicUsize>) -> SharedFetcher<Video> {
    fetcher_fn(move || {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Fetched::with_etag(video("v1", likes), format!("\"{likes}\"")))
        }
    })
}

fn offline() -> SharedFetcher<Video> {
    fetcher_fn(|| async { Err(FetchError::network("connection reset")) })
}

async fn open(dir: &std::path::Path, clock: Arc<ManualClock>) -> (CacheManager<Video>, Arc<FsBlobStore>) {
    let store = Arc::new(FsBlobStore::open(dir).await.unwrap());
    let cache = CacheManager::new(&CacheConfig::default(), store.clone(), clock);
    (cache, store)
}

#[tokio::test]
async fn test_stale_while_revalidate_at_refresh_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let (cache, _) = open(dir.path(), clock.clone()).await;
    let key = CacheKey::new(PolicyTag::Videos, "v1");
    let calls = Arc::new(AtomicUsize::new(0));

    cache.get(&key, origin(1, calls.clone()), GetOptions::default()).await.unwrap();

    // 0.8 × 15 min.
    clock.advance(12 * MIN);
    let entry = cache.peek(&key).await.unwrap();
    assert!(entry.should_refresh(clock_now(&clock)));
    assert!(!entry.is_expired(clock_now(&clock)));

    let hit = cache
        .get_with_source(&key, origin(2, calls.clone()), GetOptions::default())
        .await
        .unwrap();
    assert_eq!(hit.source, Source::Memory);
    assert_eq!(hit.freshness, Freshness::Stale);
    assert_eq!(hit.value.likes, 1);
    assert_eq!(cache.pending_refreshes().await, vec![key.clone()]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(
        cache.drain_refresh_queue().await,
        vec![RefreshOutcome::Refreshed(key.clone())]
    );
    let refreshed = cache.get(&key, origin(3, calls.clone()), GetOptions::default()).await.unwrap();
    assert_eq!(refreshed.likes, 2);
}

fn clock_now(clock: &ManualClock) -> u64 {
    use feed_cache::clock::Clock;
    clock.now()
}

#[tokio::test]
async fn test_refresh_worker_drains_queue() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let store = Arc::new(FsBlobStore::open(dir.path()).await.unwrap());
    let config = CacheConfig {
        refresh_delay_ms: 1,
        ..Default::default()
    };
    let cache: CacheManager<Video> = CacheManager::new(&config, store, clock.clone());
    let mut events = cache.subscribe();
    let key = CacheKey::new(PolicyTag::Videos, "v1");
    let calls = Arc::new(AtomicUsize::new(0));

    cache.get(&key, origin(1, calls.clone()), GetOptions::default()).await.unwrap();
    let worker = cache.spawn_refresh_worker();

    clock.advance(13 * MIN);
    cache.get(&key, origin(2, calls.clone()), GetOptions::default()).await.unwrap();

    let completed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(CacheEvent::RefreshCompleted { key }) = events.recv().await {
                return key;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(completed, "videos/v1");
    assert_eq!(cache.peek(&key).await.unwrap().data.likes, 2);

    worker.shutdown().await;
}

#[tokio::test]
async fn test_disk_tier_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let key = CacheKey::new(PolicyTag::Videos, "v1");
    let calls = Arc::new(AtomicUsize::new(0));

    {
        let (cache, _) = open(dir.path(), clock.clone()).await;
        cache.get(&key, origin(5, calls.clone()), GetOptions::default()).await.unwrap();
    }

    clock.advance(MIN);
    let (cache, _) = open(dir.path(), clock.clone()).await;
    let hit = cache
        .get_with_source(&key, origin(6, calls.clone()), GetOptions::default())
        .await
        .unwrap();
    assert_eq!(hit.source, Source::Disk);
    assert_eq!(hit.value.likes, 5);
    assert_eq!(hit.etag.as_deref(), Some("\"5\""));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_corrupt_disk_record_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let (cache, store) = open(dir.path(), clock).await;
    let key = CacheKey::new(PolicyTag::Videos, "v1");
    store
        .put(&key.storage_key(), bytes::Bytes::from_static(b"\x00not a record"))
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let got = cache
        .get_with_source(&key, origin(9, calls), GetOptions::default())
        .await
        .unwrap();
    assert_eq!(got.source, Source::Origin);
    assert_eq!(cache.stats().await.decode_failures, 1);

    // The replacement record is readable.
    let raw = store.get(&key.storage_key()).await.unwrap().unwrap();
    assert!(raw.len() > 4);
}

#[tokio::test]
async fn test_failure_semantics() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let (cache, _) = open(dir.path(), clock.clone()).await;
    let cold = CacheKey::new(PolicyTag::Videos, "cold");
    let warm = CacheKey::new(PolicyTag::Videos, "warm");

    match cache.get(&cold, offline(), GetOptions::default()).await {
        Err(CacheError::Fetch { key, source }) => {
            assert_eq!(key, cold);
            assert_eq!(source.kind, FetchErrorKind::Network);
        }
        other => panic!("expected a fetch error, got {other:?}"),
    }

    let calls = Arc::new(AtomicUsize::new(0));
    cache.get(&warm, origin(1, calls), GetOptions::default()).await.unwrap();
    clock.advance(2 * 60 * MIN);

    let got = cache
        .get_with_source(&warm, offline(), GetOptions::default())
        .await
        .unwrap();
    assert_eq!(got.source, Source::StaleFallback);
    assert_eq!(got.value.likes, 1);

    // A forced refresh that fails also falls back.
    let forced = cache
        .get_with_source(&warm, offline(), GetOptions::force_refresh())
        .await
        .unwrap();
    assert_eq!(forced.source, Source::StaleFallback);
}

#[tokio::test]
async fn test_etag_revalidation() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let (cache, _) = open(dir.path(), clock).await;
    let key = CacheKey::new(PolicyTag::Videos, "v1");
    let calls = Arc::new(AtomicUsize::new(0));

    cache.get(&key, origin(1, calls.clone()), GetOptions::default()).await.unwrap();

    let same = cache
        .check_etag_and_fetch(&key, "\"1\"", origin(2, calls.clone()))
        .await
        .unwrap();
    assert!(matches!(same, EtagOutcome::NotModified(ref v) if v.likes == 1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let changed = cache
        .check_etag_and_fetch(&key, "\"2\"", origin(2, calls.clone()))
        .await
        .unwrap();
    assert_eq!(changed.into_inner().likes, 2);

    let failed = cache
        .check_etag_and_fetch(&key, "\"3\"", offline())
        .await
        .unwrap();
    assert!(matches!(failed, EtagOutcome::Stale(ref v) if v.likes == 2));
}

#[tokio::test]
async fn test_custom_policy_max_age() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let store = Arc::new(FsBlobStore::open(dir.path()).await.unwrap());
    let mut config = CacheConfig::default();
    let stories = PolicyTag::Custom("stories".to_string());
    config
        .policies
        .set(&stories, CachePolicy::new(Duration::from_secs(30), 5, false));
    let cache: CacheManager<Video> = CacheManager::new(&config, store, clock.clone());
    let key = CacheKey::new(stories, "today");
    let calls = Arc::new(AtomicUsize::new(0));

    cache.get(&key, origin(1, calls.clone()), GetOptions::default()).await.unwrap();
    clock.advance(Duration::from_secs(31));
    let got = cache
        .get_with_source(&key, origin(2, calls.clone()), GetOptions::default())
        .await
        .unwrap();
    assert_eq!(got.source, Source::Origin);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let sweep = cache.sweep_expired().await.unwrap();
    assert_eq!(sweep.memory_removed, 0);
}
