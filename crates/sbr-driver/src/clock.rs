// SPDX-License-Identifier: AGPL-3.0-only

//! Time source and suspension point
//!
//! The engine never calls `thread::sleep` directly. Every wait goes through
//! [`Clock::wait`], which is where a run blocks while links retrain.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::macros::format_description;
use time::OffsetDateTime;

/// Format a timestamp for the run log (`2026-02-14 09:30:00.123456`).
pub fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]"
    ))
    .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

/// Wall clock and blocking wait
pub trait Clock {
    /// Current time
    fn now(&self) -> OffsetDateTime;

    /// Block for `duration`. Never returns early.
    fn wait(&self, duration: Duration);
}

/// The real clock: local time, `std::thread::sleep`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
    }

    fn wait(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A virtual clock that advances instantly and records every wait
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
    waits: Mutex<Vec<Duration>>,
}

impl ManualClock {
    /// Start at `start`
    pub fn starting_at(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
            waits: Mutex::new(Vec::new()),
        }
    }

    /// Start at the Unix epoch
    pub fn new() -> Self {
        Self::starting_at(OffsetDateTime::UNIX_EPOCH)
    }

    /// Every wait requested so far
    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().clone()
    }

    /// Sum of all waits
    pub fn elapsed(&self) -> Duration {
        self.waits.lock().iter().sum()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock()
    }

    fn wait(&self, duration: Duration) {
        *self.now.lock() += duration;
        self.waits.lock().push(duration);
    }
}

/// Cooperative cancellation flag shared between the operator and a run
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh, uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
