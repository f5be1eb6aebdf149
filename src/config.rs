//! Runtime configuration for feed-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Cache policies, refresh pacing, predictor tables and the controller window
//! all live here.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::cache::policy::PolicyTable;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "feed-cache", about = "Feed cache inspection and admin server")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Override the disk-tier directory from the config file.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the admin HTTP server over the disk tier.
    Serve {
        /// HTTP listen address (defaults to the config file's value).
        #[arg(long)]
        listen: Option<String>,
    },
    /// List disk-tier records with their freshness.
    Inspect {
        /// Only show records for this policy tag.
        #[arg(long)]
        tag: Option<String>,
    },
    /// Delete expired and unreadable disk-tier records.
    Sweep,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Admin server configuration.
    pub server: ServerConfig,

    /// Cache manager configuration.
    pub cache: CacheConfig,

    /// Navigation predictor configuration.
    pub predictor: PredictorConfig,

    /// Media controller pool configuration.
    pub pool: PoolConfig,
}

/// Admin HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "127.0.0.1:8090").
    pub listen: String,

    /// Allow cross-origin requests from any origin.
    pub permissive_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8090".to_string(),
            permissive_cors: false,
        }
    }
}

/// Cache manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory for the on-disk tier.
    pub disk_path: PathBuf,

    /// Per-tag TTL / size policies.
    pub policies: PolicyTable,

    /// Memory-tier eviction tuning.
    pub eviction: EvictionConfig,

    /// Disk record encoding.
    pub codec: CodecConfig,

    /// Pause between background refreshes, in milliseconds.
    pub refresh_delay_ms: u64,

    /// Interval of the expiry sweep, in seconds.
    pub sweep_interval_secs: u64,

    /// Capacity of the cache event channel.
    pub event_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            disk_path: PathBuf::from("/tmp/feed-cache"),
            policies: PolicyTable::default(),
            eviction: EvictionConfig::default(),
            codec: CodecConfig::default(),
            refresh_delay_ms: 500,
            sweep_interval_secs: 10 * 60,
            event_capacity: 256,
        }
    }
}

impl CacheConfig {
    pub fn refresh_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_delay_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Ranking used to pick eviction victims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionOrder {
    /// Least accessed first, oldest access breaking ties.
    #[default]
    FrequencyThenRecency,
    /// Oldest access first, access count breaking ties.
    Lru,
}

/// Eviction policy tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Ranking of victims.
    pub order: EvictionOrder,

    /// Fraction of `max_entries` removed per round (rounded up, at least one).
    pub fraction: f64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            order: EvictionOrder::FrequencyThenRecency,
            fraction: 0.2,
        }
    }
}

/// Disk record encoding settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Apply zstd compression when writing records.
    pub zstd_compression: bool,

    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            zstd_compression: true,
            zstd_level: 3,
        }
    }
}

/// Hour range `[start, end)` on a 24h clock. `start > end` wraps midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourRange {
    pub start: u32,
    pub end: u32,
}

impl HourRange {
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, hour: u32) -> bool {
        if self.start <= self.end {
            (self.start..self.end).contains(&hour)
        } else {
            hour >= self.start || hour < self.end
        }
    }
}

/// A time-of-day bucket and the screens typically opened in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBucket {
    pub hours: HourRange,
    pub screens: Vec<String>,
}

/// Navigation predictor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    /// Navigation history capacity.
    pub history_capacity: usize,

    /// How many frequent screens feed the prediction set.
    pub frequency_top_n: usize,

    /// Frequent screens seen within this many recent visits are skipped.
    pub recent_window: usize,

    /// Screens not visited for this long are forgotten, in seconds.
    pub retention_secs: u64,

    /// Interval of the retention purge, in seconds.
    pub maintenance_interval_secs: u64,

    /// Default number of predictions warmed per prefetch.
    pub prefetch_limit: usize,

    /// Let a screen appear in its own prediction set.
    pub allow_self_prediction: bool,

    /// Offset from UTC used for the time-of-day table, in minutes.
    pub utc_offset_minutes: i32,

    /// Time-of-day buckets by name.
    pub time_buckets: BTreeMap<String, TimeBucket>,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        let bucket = |start, end, screens: &[&str]| TimeBucket {
            hours: HourRange::new(start, end),
            screens: screens.iter().map(|s| s.to_string()).collect(),
        };
        let mut time_buckets = BTreeMap::new();
        time_buckets.insert("morning".to_string(), bucket(6, 12, &["home", "trending"]));
        time_buckets.insert("evening".to_string(), bucket(17, 22, &["home", "following"]));
        time_buckets.insert("night".to_string(), bucket(22, 6, &["saved", "home"]));

        Self {
            history_capacity: 20,
            frequency_top_n: 3,
            recent_window: 5,
            retention_secs: 5 * 60,
            maintenance_interval_secs: 60,
            prefetch_limit: 5,
            allow_self_prediction: false,
            utc_offset_minutes: 0,
            time_buckets,
        }
    }
}

impl PredictorConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }
}

/// Media controller pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Slots kept before the active index.
    pub keep_behind: usize,

    /// Slots kept after the active index.
    pub keep_ahead: usize,

    /// Radius of `preload_around`.
    pub preload_radius: usize,

    /// Thumbnails kept in memory.
    pub thumbnail_capacity: usize,

    /// Playback volume of the active slot when unmuted.
    pub playback_volume: f32,

    /// Capacity of the pool event channel.
    pub event_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            keep_behind: 1,
            keep_ahead: 2,
            preload_radius: 3,
            thumbnail_capacity: 64,
            playback_volume: 1.0,
            event_capacity: 64,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}
