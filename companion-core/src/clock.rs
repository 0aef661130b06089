//! The elapsed clock used to anchor alarms and crash-storm records.
//!
//! Readings are milliseconds since boot on the system-wide monotonic clock,
//! the same time base the stats daemon uses when it asks for an alarm.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use nix::time::{clock_gettime, ClockId};

use crate::error::PlatformError;
use crate::types::ElapsedMillis;

/// Monotonic milliseconds since boot.
pub trait ElapsedClock: Send + Sync {
    fn now_millis(&self) -> ElapsedMillis;
}

/// Elapsed clock backed by `CLOCK_MONOTONIC`.
///
/// The clock is sampled once at construction and advanced with
/// [`std::time::Instant`] afterwards, which reads the same clock on Linux.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    anchor: Instant,
    anchor_millis: ElapsedMillis,
}

impl MonotonicClock {
    pub fn system() -> Result<Self, PlatformError> {
        let anchor = Instant::now();
        let anchor_millis = read_monotonic_millis()?;
        Ok(Self {
            anchor,
            anchor_millis,
        })
    }
}

impl ElapsedClock for MonotonicClock {
    fn now_millis(&self) -> ElapsedMillis {
        let elapsed = i64::try_from(self.anchor.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.anchor_millis.saturating_add(elapsed)
    }
}

/// Current `CLOCK_MONOTONIC` reading in milliseconds.
pub fn read_monotonic_millis() -> Result<ElapsedMillis, PlatformError> {
    let now = clock_gettime(ClockId::CLOCK_MONOTONIC)
        .map_err(|errno| PlatformError::Unavailable(format!("CLOCK_MONOTONIC: {errno}")))?;
    Ok(i64::from(now.tv_sec()) * 1_000 + i64::from(now.tv_nsec()) / 1_000_000)
}

/// Hand-driven clock for tests and simulations.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn starting_at(millis: ElapsedMillis) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(millis)),
        }
    }

    pub fn set(&self, millis: ElapsedMillis) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: ElapsedMillis) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl ElapsedClock for ManualClock {
    fn now_millis(&self) -> ElapsedMillis {
        self.now.load(Ordering::SeqCst)
    }
}
