//! Time source
//!
//! Buffered-row ages, idle accounting, dump names and rollover boundaries all
//! read time through [`Clock`]. Production uses the system wall clock; tests
//! and the DST harness move a [`SimulatedClock`] by hand.

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Wall-clock instant in milliseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Time from `earlier` to `self`, zero if `earlier` is later
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    pub fn to_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.0 as i64).unwrap_or_default()
    }

    /// Local wall time, used for `*_NOW` local columns and rollover periods
    pub fn to_local(&self) -> NaiveDateTime {
        self.to_utc().with_timezone(&Local).naive_local()
    }
}

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Timestamp;
}

/// System wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct ProductionClock;

impl ProductionClock {
    pub fn new() -> Self {
        ProductionClock
    }
}

impl Clock for ProductionClock {
    fn now(&self) -> Timestamp {
        Timestamp(Utc::now().timestamp_millis().max(0) as u64)
    }
}

/// Virtual clock; clones share one time
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    now_ms: Arc<AtomicU64>,
}

impl SimulatedClock {
    pub fn new(start_ms: u64) -> Self {
        SimulatedClock {
            now_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.now_ms.load(Ordering::SeqCst))
    }
}
