//! Monotonic → calendar time conversion
//!
//! Probes only read the cheap kernel monotonic clock. To turn those readings
//! into wall-clock times, each conversion samples both clocks once and
//! shifts calendar "now" back by how long ago each reading happened:
//!
//! ```text
//! monotonic:  t0 ───── t1 ──────── t2 ─────────── mono_now
//!                                                    │ same instant
//! calendar:   now-(mono_now-t0) ...               now
//! ```
//!
//! The error is bounded by the time between the clock samples plus
//! scheduling jitter. Samples are never reused across calls.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use nix::sys::time::TimeSpec;
use nix::time::{clock_gettime, ClockId};
use tracing::warn;

use super::span::Span;

/// Source of the two clocks.
pub trait Clocks: Send + Sync {
    /// Calendar time
    fn now(&self) -> SystemTime;
    /// Monotonic time since boot, same clock as `bpf_ktime_get_ns`
    fn monotonic(&self) -> Duration;
}

/// The host clocks
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClocks;

impl Clocks for SystemClocks {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic(&self) -> Duration {
        monotonic_or_zero(clock_gettime(ClockId::CLOCK_MONOTONIC))
    }
}

/// A failed read yields zero, which shifts every converted timestamp
/// forward by its full monotonic value, so it is always logged.
fn monotonic_or_zero(reading: nix::Result<TimeSpec>) -> Duration {
    match reading {
        Ok(ts) => Duration::from(ts),
        Err(errno) => {
            warn!(error = %errno, "clock_gettime(CLOCK_MONOTONIC) failed, span times will be wrong");
            Duration::ZERO
        }
    }
}

/// Calendar times of a span's three timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub request_start: SystemTime,
    pub start: SystemTime,
    pub end: SystemTime,
}

/// Calendar interval `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: SystemTime,
    pub end: SystemTime,
}

impl Interval {
    pub fn new(start: SystemTime, end: SystemTime) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, inner: &Interval) -> bool {
        inner.start >= self.start && inner.end <= self.end
    }

    pub fn duration(&self) -> Duration {
        self.end.duration_since(self.start).unwrap_or_default()
    }
}

impl Timings {
    /// Whole request: received → response written
    pub fn request(&self) -> Interval {
        Interval::new(self.request_start, self.end)
    }

    /// Waiting before the handler picked the request up
    pub fn queue(&self) -> Interval {
        Interval::new(self.request_start, self.start)
    }

    pub fn processing(&self) -> Interval {
        Interval::new(self.start, self.end)
    }
}

/// Converts monotonic probe timestamps using injected clocks.
#[derive(Clone)]
pub struct SpanTimer {
    clocks: Arc<dyn Clocks>,
}

impl SpanTimer {
    pub fn new(clocks: Arc<dyn Clocks>) -> Self {
        Self { clocks }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemClocks))
    }

    /// Convert several monotonic nanosecond readings against one sample of
    /// both clocks, so the results keep their relative order and spacing.
    pub fn to_calendar<const N: usize>(&self, mono_ns: [u64; N]) -> [SystemTime; N] {
        let now = self.clocks.now();
        let mono_now = self.clocks.monotonic();
        mono_ns.map(|t| shift(now, mono_now, Duration::from_nanos(t)))
    }

    pub fn timings(&self, span: &Span) -> Timings {
        let [request_start, start, end] = self.to_calendar([span.request_start, span.start, span.end]);
        Timings {
            request_start,
            start,
            end,
        }
    }
}

impl Default for SpanTimer {
    fn default() -> Self {
        Self::system()
    }
}

impl std::fmt::Debug for SpanTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanTimer").finish_non_exhaustive()
    }
}

/// `now - (mono_now - t)`, or forward when `t` is after `mono_now`.
fn shift(now: SystemTime, mono_now: Duration, t: Duration) -> SystemTime {
    match mono_now.checked_sub(t) {
        Some(ago) => now.checked_sub(ago).unwrap_or(SystemTime::UNIX_EPOCH),
        None => now + (t - mono_now),
    }
}
