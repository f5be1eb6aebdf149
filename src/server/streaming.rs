//! SSE (Server-Sent Events) feed of cache events.
//!
//! Each [`CacheEvent`] becomes one SSE event named after its variant, with the
//! JSON-encoded event as data. Subscribers that fall behind skip the events
//! they missed and receive a `lagged` event with the number dropped.

use axum::response::sse::Event;
use futures::stream::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::cache::manager::CacheEvent;

/// SSE event name for a cache event.
pub fn event_name(event: &CacheEvent) -> &'static str {
    match event {
        CacheEvent::Stored { .. } => "stored",
        CacheEvent::Evicted { .. } => "evicted",
        CacheEvent::RefreshScheduled { .. } => "refresh_scheduled",
        CacheEvent::RefreshCompleted { .. } => "refresh_completed",
        CacheEvent::RefreshFailed { .. } => "refresh_failed",
        CacheEvent::StaleServed { .. } => "stale_served",
        CacheEvent::Invalidated { .. } => "invalidated",
        CacheEvent::Swept { .. } => "swept",
    }
}

/// Convert a cache event receiver into an SSE stream.
pub fn cache_events_to_sse_stream(
    rx: broadcast::Receiver<CacheEvent>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    BroadcastStream::new(rx).map(|item| {
        let event = match item {
            Ok(event) => {
                let data = serde_json::to_string(&event).unwrap_or_default();
                Event::default().event(event_name(&event)).data(data)
            }
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                Event::default().event("lagged").data(missed.to_string())
            }
        };
        Ok(event)
    })
}
