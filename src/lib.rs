//! feed-cache: client-side caching and preloading for video feeds.
//!
//! Three cooperating pieces:
//!   - A two-tier (memory + disk) cache with per-tag TTL policies,
//!     stale-while-revalidate background refresh and ETag revalidation
//!   - A navigation predictor that warms the cache for likely-next screens
//!   - A sliding-window pool of media decoders around the active feed item
//!
//! Exposes an admin HTTP API for inspection and invalidation.

pub mod cache;
pub mod clock;
pub mod config;
pub mod fetch;
pub mod media;
pub mod predict;
pub mod server;
pub mod store;
