//! Media playback resources for the feed.
//!
//! - [`source`]: decoder, media source and thumbnail interfaces
//! - [`pool`]: ControllerPool keeping a sliding window of decoders around the active page

pub mod pool;
pub mod source;

pub use pool::{ControllerPool, PoolEvent, PreloadReport, SlotSnapshot, SlotState};
pub use source::{MediaError, MediaHandle, MediaItem, MediaSource, MediaStatus, ThumbnailFetcher};
