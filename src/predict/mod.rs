//! Navigation prediction and speculative prefetch.
//!
//! - [`graph`]: bounded history, visit frequency and per-screen prediction sets
//! - [`warmer`]: how a predicted screen's data gets into the cache
//! - [`preloader`]: SmartPreloader tying the graph to warmers, with accuracy tracking

pub mod graph;
pub mod preloader;
pub mod warmer;

pub use graph::NavigationGraph;
pub use preloader::{PrefetchBatch, PreloaderStats, SmartPreloader};
pub use warmer::{CacheWarmer, NoopWarmer, ScreenWarmer, WarmError, WarmReport};
