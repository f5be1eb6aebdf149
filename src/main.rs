//! feed-cache: admin server and maintenance CLI for the feed cache's disk tier.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::info;

use feed_cache::cache::policy::PolicyTag;
use feed_cache::cache::CacheManager;
use feed_cache::clock::system_clock;
use feed_cache::config::{Cli, Command, Config};
use feed_cache::predict::{CacheWarmer, SmartPreloader};
use feed_cache::server::admin_api::{build_router, AppState};
use feed_cache::server::metrics::Metrics;
use feed_cache::store::FsBlobStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "feed_cache=debug,tower_http=debug"
    } else {
        "feed_cache=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("feed-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(dir) = &cli.cache_dir {
        config.cache.disk_path = dir.clone();
    }
    let config = Arc::new(config);

    info!(
        disk_path = %config.cache.disk_path.display(),
        refresh_delay_ms = config.cache.refresh_delay_ms,
        sweep_interval_secs = config.cache.sweep_interval_secs,
        "Configuration loaded"
    );

    let store = Arc::new(FsBlobStore::open(&config.cache.disk_path).await?);
    let cache: CacheManager<Value> = CacheManager::new(&config.cache, store, system_clock());

    match cli.command {
        Command::Serve { listen } => serve(config, cache, listen).await,
        Command::Inspect { tag } => inspect(&cache, tag.as_deref()).await,
        Command::Sweep => {
            let report = cache.sweep_expired().await?;
            println!(
                "removed {} expired record(s), {} of them unreadable",
                report.disk_removed, report.disk_corrupt
            );
            Ok(())
        }
    }
}

async fn serve(
    config: Arc<Config>,
    cache: CacheManager<Value>,
    listen: Option<String>,
) -> anyhow::Result<()> {
    // Background maintenance.
    let refresh_worker = cache.spawn_refresh_worker();
    let sweeper = cache.spawn_sweeper();

    let warmer = Arc::new(CacheWarmer::new(cache.clone()));
    let preloader = Arc::new(SmartPreloader::new(
        config.predictor.clone(),
        warmer,
        system_clock(),
    ));
    let maintenance = preloader.spawn_maintenance();

    // Build application state.
    let state = Arc::new(AppState {
        cache,
        preloader,
        metrics: Metrics::new()?,
        config: config.clone(),
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = listen.unwrap_or_else(|| config.server.listen.clone());
    info!(addr = %listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    sweeper.abort();
    maintenance.abort();
    refresh_worker.shutdown().await;
    Ok(())
}

async fn inspect(cache: &CacheManager<Value>, tag: Option<&str>) -> anyhow::Result<()> {
    let tag = tag.map(PolicyTag::from_name);
    let records = cache.disk_index().await?;

    let mut shown = 0;
    for record in &records {
        if let Some(tag) = &tag {
            if !record.key.starts_with(&format!("{tag}/")) {
                continue;
            }
        }
        println!(
            "{:<48} {:>8} {:>6}s / {:<6}s hits={:<5} {}",
            record.key,
            record.freshness,
            record.age_secs,
            record.max_age_secs,
            record.access_count,
            record.etag.as_deref().unwrap_or("-"),
        );
        shown += 1;
    }
    info!(shown, total = records.len(), "Inspection complete");
    Ok(())
}
