//! Origin fetchers.
//!
//! The cache never talks to the network itself. Callers hand it a
//! [`Fetcher`] that produces the payload (and optionally an ETag) on a miss
//! or a background refresh. Timeouts are the fetcher's business.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Coarse category of an origin failure, used by the UI layer to pick a
/// user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Timeout,
    Network,
    Auth,
    Permission,
    NotFound,
    Conflict,
    Other,
}

impl std::fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FetchErrorKind::Timeout => "timeout",
            FetchErrorKind::Network => "network",
            FetchErrorKind::Auth => "auth",
            FetchErrorKind::Permission => "permission",
            FetchErrorKind::NotFound => "not-found",
            FetchErrorKind::Conflict => "conflict",
            FetchErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone)]
#[error("origin fetch failed ({kind}): {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Timeout, message)
    }

    /// Map an HTTP status code to an error category.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            401 => FetchErrorKind::Auth,
            403 => FetchErrorKind::Permission,
            404 => FetchErrorKind::NotFound,
            408 | 504 => FetchErrorKind::Timeout,
            409 => FetchErrorKind::Conflict,
            502 | 503 => FetchErrorKind::Network,
            _ => FetchErrorKind::Other,
        };
        Self::new(kind, message)
    }
}

/// A payload produced by the origin.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub data: T,
    pub etag: Option<String>,
}

impl<T> Fetched<T> {
    pub fn new(data: T) -> Self {
        Self { data, etag: None }
    }

    pub fn with_etag(data: T, etag: impl Into<String>) -> Self {
        Self {
            data,
            etag: Some(etag.into()),
        }
    }
}

/// Caller-supplied async producer used on cache miss and refresh.
#[async_trait]
pub trait Fetcher<T>: Send + Sync {
    async fn fetch(&self) -> Result<Fetched<T>, FetchError>;
}

#[async_trait]
impl<T, F, Fut> Fetcher<T> for F
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Fetched<T>, FetchError>> + Send,
{
    async fn fetch(&self) -> Result<Fetched<T>, FetchError> {
        (self)().await
    }
}

/// Shared, type-erased fetcher. Kept alongside queued refreshes.
pub type SharedFetcher<T> = Arc<dyn Fetcher<T>>;

/// Wrap a closure returning a future into a [`SharedFetcher`].
pub fn fetcher_fn<T, F, Fut>(f: F) -> SharedFetcher<T>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Fetched<T>, FetchError>> + Send + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closure_fetcher() {
        let fetcher = fetcher_fn(|| async { Ok(Fetched::with_etag(7u32, "v1")) });
        let got = fetcher.fetch().await.unwrap();
        assert_eq!(got.data, 7);
        assert_eq!(got.etag.as_deref(), Some("v1"));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(FetchError::from_status(401, "x").kind, FetchErrorKind::Auth);
        assert_eq!(FetchError::from_status(404, "x").kind, FetchErrorKind::NotFound);
        assert_eq!(FetchError::from_status(409, "x").kind, FetchErrorKind::Conflict);
        assert_eq!(FetchError::from_status(500, "x").kind, FetchErrorKind::Other);
    }
}
