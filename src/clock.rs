//! Wall-clock abstraction.
//!
//! Freshness, retention windows and time-of-day predictions are all computed
//! from a [`Clock`] so that tests can drive time explicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Timelike, Utc};

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now(&self) -> Timestamp;
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now().timestamp_millis().max(0) as u64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Jump to an absolute time.
    pub fn set(&self, to: Timestamp) {
        self.now.store(to, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// The process clock used when none is injected.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Hour of day (0-23) for a timestamp shifted by `utc_offset_minutes`.
///
/// Offsets outside +/-24h are treated as UTC.
pub fn hour_of_day(ts: Timestamp, utc_offset_minutes: i32) -> u32 {
    let Some(utc) = i64::try_from(ts)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
    else {
        return 0;
    };
    match utc_offset_minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
    {
        Some(offset) => utc.with_timezone(&offset).hour(),
        None => utc.hour(),
    }
}
