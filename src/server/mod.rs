//! HTTP admin server for a running cache.
//!
//! - [`admin_api`]: Request/response types and route handlers
//! - [`streaming`]: SSE feed of cache events
//! - [`metrics`]: Prometheus exposition

pub mod admin_api;
pub mod metrics;
pub mod streaming;
