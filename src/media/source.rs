//! Media decoder and thumbnail interfaces consumed by the controller pool.
//!
//! The pool never talks to a player backend directly. A [`MediaSource`]
//! opens a [`MediaHandle`] for an adaptive-stream manifest; thumbnails come
//! from a [`ThumbnailFetcher`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fetch::FetchError;

/// File extension of an HLS manifest.
pub const HLS_EXTENSION: &str = ".m3u8";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MediaError {
    /// The item has no adaptive-stream manifest. There is no single-file fallback.
    #[error("Item {id} has no HLS manifest")]
    MissingManifest { id: String },

    #[error("Index {index} is outside the playlist (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Initialization failed: {0}")]
    Init(String),

    #[error("Playback control failed: {0}")]
    Playback(String),

    #[error("Disposal failed: {0}")]
    Disposal(String),
}

/// One entry of the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    pub hls_url: Option<String>,
    pub thumbnail_url: Option<String>,
}

impl MediaItem {
    pub fn new(id: impl Into<String>, hls_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hls_url: Some(hls_url.into()),
            thumbnail_url: None,
        }
    }

    pub fn with_thumbnail(mut self, url: impl Into<String>) -> Self {
        self.thumbnail_url = Some(url.into());
        self
    }

    /// The HLS manifest URL, if the item has one. Query strings and fragments
    /// are ignored when checking the extension.
    pub fn manifest_url(&self) -> Option<&str> {
        let url = self.hls_url.as_deref()?;
        let path = url.split(['?', '#']).next().unwrap_or(url);
        path.to_ascii_lowercase()
            .ends_with(HLS_EXTENSION)
            .then_some(url)
    }
}

/// Observable state of a decoder handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MediaStatus {
    pub initialized: bool,
    pub playing: bool,
    pub has_error: bool,
    pub volume: f32,
    pub position: Duration,
}

/// An opened adaptive-stream decoder.
#[async_trait]
pub trait MediaHandle: Send + Sync {
    async fn initialize(&mut self) -> Result<(), MediaError>;

    async fn play(&mut self) -> Result<(), MediaError>;

    async fn pause(&mut self) -> Result<(), MediaError>;

    /// 0.0 mutes.
    async fn set_volume(&mut self, volume: f32) -> Result<(), MediaError>;

    async fn seek_to(&mut self, position: Duration) -> Result<(), MediaError>;

    /// Release decoder resources. The handle is dropped afterwards whether or
    /// not this succeeds.
    async fn dispose(&mut self) -> Result<(), MediaError>;

    fn status(&self) -> MediaStatus;
}

/// Opens decoder handles for manifest URLs.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn open(&self, manifest_url: &str) -> Result<Box<dyn MediaHandle>, MediaError>;
}

/// Loads thumbnail images. Failures are never fatal to the pool.
#[async_trait]
pub trait ThumbnailFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_detection() {
        assert_eq!(
            MediaItem::new("a", "https://cdn/v/a/master.m3u8").manifest_url(),
            Some("https://cdn/v/a/master.m3u8")
        );
        assert!(MediaItem::new("b", "https://cdn/v/b/index.M3U8?token=x")
            .manifest_url()
            .is_some());
        assert_eq!(MediaItem::new("c", "https://cdn/v/c.mp4").manifest_url(), None);
        assert_eq!(MediaItem::new("d", "https://cdn/v/d.mp4?f=.m3u8").manifest_url(), None);

        let none = MediaItem {
            id: "e".into(),
            hls_url: None,
            thumbnail_url: None,
        };
        assert_eq!(none.manifest_url(), None);
    }
}
