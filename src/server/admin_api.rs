//! Admin HTTP API over a running cache.
//!
//! Routes:
//! - GET /health
//! - GET /v1/cache/stats
//! - POST /v1/cache/sweep
//! - DELETE /v1/cache/{tag}
//! - DELETE /v1/cache/{tag}/{key}
//! - POST /v1/navigation
//! - GET /v1/predictions/{screen}
//! - GET /v1/events (SSE)
//! - GET /metrics (prometheus text)

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::manager::{CacheStats, SweepReport};
use crate::cache::policy::{CacheKey, PolicyTag};
use crate::cache::CacheManager;
use crate::config::Config;
use crate::predict::{PreloaderStats, SmartPreloader};
use crate::server::metrics::Metrics;
use crate::server::streaming::cache_events_to_sse_stream;

/// Application state shared across handlers.
pub struct AppState {
    pub cache: CacheManager<Value>,
    pub preloader: Arc<SmartPreloader>,
    pub metrics: Metrics,
    pub config: Arc<Config>,
    pub start_time: Instant,
}

/// Build the axum router with all admin routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = state.config.server.permissive_cors;
    let router = Router::new()
        .route("/health", get(health))
        .route("/v1/cache/stats", get(stats))
        .route("/v1/cache/sweep", post(sweep))
        .route("/v1/cache/{tag}", delete(invalidate_tag))
        .route("/v1/cache/{tag}/{key}", delete(invalidate_key))
        .route("/v1/navigation", post(track_navigation))
        .route("/v1/predictions/{screen}", get(predictions))
        .route("/v1/events", get(events))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub memory_entries: usize,
    pub refresh_pending: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub cache: CacheStats,
    pub hit_rate: f64,
    pub predictor: PreloaderStats,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvalidateResponse {
    pub tag: String,
    pub key: Option<String>,
    pub removed: usize,
}

/// A screen transition reported by the client.
#[derive(Debug, Deserialize)]
pub struct NavigationRequest {
    pub screen: String,

    /// Screen the user came from. When set, the transition is scored against
    /// that screen's predictions.
    #[serde(default)]
    pub from: Option<String>,

    /// Start warming the new screen's predictions.
    #[serde(default = "default_prefetch")]
    pub prefetch: bool,
}

fn default_prefetch() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NavigationResponse {
    pub screen: String,
    /// Whether `screen` was predicted from `from`, if `from` was given.
    pub predicted: Option<bool>,
    pub prefetch_batch: Option<Uuid>,
    pub prefetching: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictionsResponse {
    pub screen: String,
    pub predictions: Vec<String>,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let stats = state.cache.stats().await;
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        memory_entries: stats.total_entries(),
        refresh_pending: stats.refresh_pending,
    })
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let cache = state.cache.stats().await;
    Json(StatsResponse {
        hit_rate: cache.hit_rate(),
        cache,
        predictor: state.preloader.stats().await,
    })
}

async fn sweep(State(state): State<Arc<AppState>>) -> Result<Json<SweepReport>, StatusCode> {
    let report = state.cache.sweep_expired().await.map_err(|e| {
        warn!("Sweep failed: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(report))
}

async fn invalidate_tag(
    State(state): State<Arc<AppState>>,
    Path(tag): Path<String>,
) -> Result<Json<InvalidateResponse>, StatusCode> {
    let policy_tag = PolicyTag::from_name(&tag);
    let removed = state.cache.invalidate_tag(&policy_tag).await.map_err(|e| {
        warn!(tag = %tag, "Invalidate failed: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    info!(tag = %tag, removed, "Tag invalidated via admin API");
    Ok(Json(InvalidateResponse {
        tag,
        key: None,
        removed,
    }))
}

async fn invalidate_key(
    State(state): State<Arc<AppState>>,
    Path((tag, key)): Path<(String, String)>,
) -> Result<Json<InvalidateResponse>, StatusCode> {
    let cache_key = CacheKey::new(PolicyTag::from_name(&tag), key.clone());
    let removed = state.cache.invalidate(&cache_key).await.map_err(|e| {
        warn!(key = %cache_key, "Invalidate failed: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(InvalidateResponse {
        tag,
        key: Some(key),
        removed: usize::from(removed),
    }))
}

async fn track_navigation(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NavigationRequest>,
) -> Result<Json<NavigationResponse>, StatusCode> {
    if req.screen.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let predicted = match &req.from {
        Some(from) => {
            let hit = state
                .preloader
                .predictions(from)
                .await
                .iter()
                .any(|s| *s == req.screen);
            if hit {
                state.preloader.record_hit(&req.screen);
            } else {
                state.preloader.record_miss(&req.screen);
            }
            Some(hit)
        }
        None => None,
    };

    state.preloader.track_navigation(&req.screen).await;

    let (prefetch_batch, prefetching) = if req.prefetch {
        let batch = state.preloader.prefetch_default(&req.screen).await;
        let id = (!batch.is_empty()).then_some(batch.id);
        let screens = batch.screens.clone();
        // Warm tasks are detached and outlive the batch handle.
        tokio::spawn(batch.wait());
        (id, screens)
    } else {
        (None, Vec::new())
    };

    Ok(Json(NavigationResponse {
        screen: req.screen,
        predicted,
        prefetch_batch,
        prefetching,
    }))
}

async fn predictions(
    State(state): State<Arc<AppState>>,
    Path(screen): Path<String>,
) -> Json<PredictionsResponse> {
    let predictions = state.preloader.predictions(&screen).await;
    Json(PredictionsResponse { screen, predictions })
}

async fn events(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stream = cache_events_to_sse_stream(state.cache.subscribe());
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, StatusCode> {
    let cache = state.cache.stats().await;
    let predictor = state.preloader.stats().await;
    state.metrics.observe(&cache, &predictor);
    let body = state.metrics.render().map_err(|e| {
        warn!("Metrics encoding failed: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}
