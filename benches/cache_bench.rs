//! Benchmarks for the feed cache hot paths.

use std::collections::HashMap;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use feed_cache::cache::codec::RecordCodec;
use feed_cache::cache::entry::CacheEntry;
use feed_cache::cache::evictor::Evictor;
use feed_cache::cache::policy::{CacheKey, PolicyTag};
use feed_cache::config::{CodecConfig, EvictionConfig, PredictorConfig};
use feed_cache::predict::NavigationGraph;

fn bench_eviction_selection(c: &mut Criterion) {
    let evictor = Evictor::new(EvictionConfig::default());

    // 10,000 entries with scattered access patterns.
    let entries: HashMap<String, CacheEntry<u64>> = (0..10_000u64)
        .map(|i| {
            let mut entry = CacheEntry::new(i, None, Duration::from_secs(900), 0);
            entry.access_count = (i * 7919) % 50;
            entry.last_accessed = (i * 104_729) % 1_000_000;
            (format!("video-{i}"), entry)
        })
        .collect();

    c.bench_function("eviction_select_2000_from_10k", |b| {
        b.iter(|| {
            let victims = evictor.select_victims(black_box(entries.iter()), 2_000);
            black_box(victims);
        })
    });
}

fn bench_record_codec(c: &mut Criterion) {
    let key = CacheKey::new(PolicyTag::Feed, "home");
    // A feed page of ~200 items.
    let page: Vec<serde_json::Value> = (0..200)
        .map(|i| {
            serde_json::json!({
                "id": format!("v{i}"),
                "title": format!("Video number {i}"),
                "hls_url": format!("https://cdn.example.com/v{i}/index.m3u8"),
                "likes": i * 13,
            })
        })
        .collect();
    let entry = CacheEntry::new(page, Some("\"abc\"".to_string()), Duration::from_secs(300), 0);

    for (name, zstd_compression) in [("zstd", true), ("plain", false)] {
        let codec = RecordCodec::new(CodecConfig {
            zstd_compression,
            ..Default::default()
        });
        let Ok(raw) = codec.encode(&key, &entry) else {
            continue;
        };

        c.bench_function(&format!("record_encode_{name}"), |b| {
            b.iter(|| black_box(codec.encode(&key, black_box(&entry))))
        });
        c.bench_function(&format!("record_decode_{name}"), |b| {
            b.iter(|| {
                let decoded: Result<CacheEntry<Vec<serde_json::Value>>, _> =
                    codec.decode(&key, black_box(&raw));
                black_box(decoded)
            })
        });
    }
}

fn bench_navigation_tracking(c: &mut Criterion) {
    let screens = ["home", "feed", "profile", "search", "settings", "inbox"];

    c.bench_function("navigation_track_1k", |b| {
        b.iter(|| {
            let mut graph = NavigationGraph::new(PredictorConfig::default());
            for i in 0..1_000u64 {
                graph.track(screens[(i * 5 % 6) as usize], i * 1_000);
            }
            black_box(graph.predictions("home").len());
        })
    });
}

criterion_group!(
    benches,
    bench_eviction_selection,
    bench_record_codec,
    bench_navigation_tracking,
);
criterion_main!(benches);
