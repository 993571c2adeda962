//! Virtual time, the pipeline clock, and replay descriptors.
//!
//! [`Instant`] is the sole correctness-relevant clock: a monotonically
//! ordered 100-ns-tick absolute time. [`Clock`] maps between wall time and
//! pipeline-virtual time with an origin and a rate; in replay mode the
//! origin is the replay interval's start.

use std::ops::{Add, Sub};
use std::time::{Duration as StdDuration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A 100-nanosecond tick, counted from the Unix epoch.
///
/// This crate does not interoperate with an existing on-disk store from
/// another system, so the Unix epoch is used as the fixed origin (see
/// `SPEC_FULL.md` open-question decisions). A future integration with an
/// existing store would need to re-derive the correct epoch offset.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// An absolute instant in pipeline-virtual time, with total ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Instant(i64);

impl Instant {
    /// The smallest representable instant.
    pub const MIN: Instant = Instant(i64::MIN);
    /// The largest representable instant.
    pub const MAX: Instant = Instant(i64::MAX);

    /// Builds an instant from a raw tick count.
    #[must_use]
    pub const fn from_ticks(ticks: i64) -> Self {
        Instant(ticks)
    }

    /// Returns the raw tick count.
    #[must_use]
    pub const fn ticks(self) -> i64 {
        self.0
    }

    /// Builds an instant from the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(StdDuration::ZERO);
        Self::from_std_duration(elapsed)
    }

    /// Converts a duration since the epoch into an instant.
    #[must_use]
    pub fn from_std_duration(d: StdDuration) -> Self {
        let ticks = (d.as_secs() as i64)
            .saturating_mul(TICKS_PER_SECOND)
            .saturating_add((d.subsec_nanos() as i64) / 100);
        Instant(ticks)
    }

    /// Adds a tick-denominated duration, saturating at the bounds.
    #[must_use]
    pub fn checked_add_ticks(self, ticks: i64) -> Option<Self> {
        self.0.checked_add(ticks).map(Instant)
    }

    /// Returns the one-tick successor (used for monotonic originating-time
    /// correction in the interpolation/fusion layer).
    #[must_use]
    pub fn next_tick(self) -> Self {
        Instant(self.0.saturating_add(1))
    }

    /// Absolute difference between two instants, in ticks.
    #[must_use]
    pub fn abs_diff_ticks(self, other: Instant) -> u64 {
        self.0.abs_diff(other.0)
    }
}

impl Add<TickDelta> for Instant {
    type Output = Instant;
    fn add(self, rhs: TickDelta) -> Instant {
        Instant(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Instant {
    type Output = TickDelta;
    fn sub(self, rhs: Instant) -> TickDelta {
        TickDelta(self.0.saturating_sub(rhs.0))
    }
}

/// A signed duration in ticks, used for relative time windows
/// (`W = [t+wL, t+wR]`) in the interpolation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TickDelta(i64);

impl TickDelta {
    /// Zero offset.
    pub const ZERO: TickDelta = TickDelta(0);

    /// Builds a delta from a raw tick count.
    #[must_use]
    pub const fn from_ticks(ticks: i64) -> Self {
        TickDelta(ticks)
    }

    /// Builds a delta from a millisecond count.
    #[must_use]
    pub const fn from_millis(ms: i64) -> Self {
        TickDelta(ms * (TICKS_PER_SECOND / 1000))
    }

    /// Raw tick count.
    #[must_use]
    pub const fn ticks(self) -> i64 {
        self.0
    }
}

/// Maps between wall time and pipeline-virtual time.
///
/// In live mode the origin is process start and the rate is 1:1 with wall
/// time. In replay mode the origin is the replay interval's start; whether
/// the scheduler paces delivery to track wall time is controlled by
/// [`ReplayDescriptor::enforce_replay_clock`], not by the clock itself.
#[derive(Debug, Clone)]
pub struct Clock {
    /// Virtual instant corresponding to `origin_wall`.
    origin_virtual: Instant,
    /// Wall-clock instant the clock was created at (elapsed-ticks base).
    origin_wall: std::time::Instant,
}

impl Clock {
    /// Creates a live clock whose origin is "now".
    #[must_use]
    pub fn live() -> Self {
        Self {
            origin_virtual: Instant::now(),
            origin_wall: std::time::Instant::now(),
        }
    }

    /// Creates a clock for replay, with virtual time originating at
    /// `replay_start` regardless of wall-clock time.
    #[must_use]
    pub fn for_replay(replay_start: Instant) -> Self {
        Self {
            origin_virtual: replay_start,
            origin_wall: std::time::Instant::now(),
        }
    }

    /// Returns the current virtual instant.
    #[must_use]
    pub fn now(&self) -> Instant {
        let elapsed = self.origin_wall.elapsed();
        self.origin_virtual + TickDelta::from_ticks(Self::std_duration_to_ticks(elapsed))
    }

    /// Maps an elapsed wall-clock tick count (since this clock's creation)
    /// to a virtual instant.
    #[must_use]
    pub fn from_elapsed_ticks(&self, elapsed_ticks: i64) -> Instant {
        self.origin_virtual + TickDelta::from_ticks(elapsed_ticks)
    }

    /// Converts a virtual instant to the wall-clock [`std::time::Duration`]
    /// from now until that instant becomes current (zero if already past).
    #[must_use]
    pub fn to_real_delay(&self, virtual_instant: Instant) -> StdDuration {
        let now = self.now();
        if virtual_instant <= now {
            return StdDuration::ZERO;
        }
        let delta = (virtual_instant - now).ticks();
        Self::ticks_to_std_duration(delta)
    }

    /// Converts a virtual duration to a real (wall-clock) duration. The
    /// live clock runs 1:1, so this is a direct unit conversion.
    #[must_use]
    pub fn to_real(&self, virtual_delta: TickDelta) -> StdDuration {
        Self::ticks_to_std_duration(virtual_delta.ticks().max(0))
    }

    /// Converts a real (wall-clock) duration to an equivalent virtual
    /// duration. The live clock runs 1:1, so this is a direct unit
    /// conversion.
    #[must_use]
    pub fn to_virtual(&self, real: StdDuration) -> TickDelta {
        TickDelta::from_ticks(Self::std_duration_to_ticks(real))
    }

    fn std_duration_to_ticks(d: StdDuration) -> i64 {
        (d.as_secs() as i64).saturating_mul(TICKS_PER_SECOND)
            + (d.subsec_nanos() as i64) / 100
    }

    fn ticks_to_std_duration(ticks: i64) -> StdDuration {
        if ticks <= 0 {
            return StdDuration::ZERO;
        }
        let secs = ticks / TICKS_PER_SECOND;
        let rem_ticks = ticks % TICKS_PER_SECOND;
        StdDuration::new(secs as u64, (rem_ticks * 100) as u32)
    }
}

/// A bounded replay window plus whether delivery should be paced to track
/// wall time.
///
/// `interval == [Instant::MIN, Instant::MAX]` means "replay all". The
/// pipeline intersects a proposed replay interval (e.g. from subpipelines
/// or store sources) with this one; the result never expands beyond either
/// input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayDescriptor {
    /// Inclusive start of the replay window.
    pub start: Instant,
    /// Inclusive end of the replay window.
    pub end: Instant,
    /// Whether the scheduler should sleep between deliveries so that
    /// virtual time tracks wall time.
    pub enforce_replay_clock: bool,
}

impl ReplayDescriptor {
    /// Replay descriptor covering the entire timeline, without clock
    /// enforcement (deliver as fast as possible).
    #[must_use]
    pub const fn all() -> Self {
        Self {
            start: Instant::MIN,
            end: Instant::MAX,
            enforce_replay_clock: false,
        }
    }

    /// Creates a bounded replay descriptor.
    #[must_use]
    pub const fn bounded(start: Instant, end: Instant, enforce_replay_clock: bool) -> Self {
        Self {
            start,
            end,
            enforce_replay_clock,
        }
    }

    /// Intersects this descriptor's interval with another's, keeping this
    /// descriptor's `enforce_replay_clock` flag.
    #[must_use]
    pub fn intersect(&self, other: &ReplayDescriptor) -> Self {
        Self {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
            enforce_replay_clock: self.enforce_replay_clock,
        }
    }

    /// True if `t` falls within `[start, end]`.
    #[must_use]
    pub fn contains(&self, t: Instant) -> bool {
        t >= self.start && t <= self.end
    }
}

impl Default for ReplayDescriptor {
    fn default() -> Self {
        Self::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_ordering_is_total() {
        let a = Instant::from_ticks(10);
        let b = Instant::from_ticks(20);
        assert!(a < b);
        assert_eq!(a.next_tick(), Instant::from_ticks(11));
    }

    #[test]
    fn instant_min_max_bound_everything() {
        assert!(Instant::MIN < Instant::from_ticks(0));
        assert!(Instant::from_ticks(0) < Instant::MAX);
    }

    #[test]
    fn tick_delta_from_millis_round_trips_seconds() {
        let one_second = TickDelta::from_millis(1000);
        assert_eq!(one_second.ticks(), TICKS_PER_SECOND);
    }

    #[test]
    fn replay_descriptor_intersect_narrows_interval() {
        let a = ReplayDescriptor::bounded(Instant::from_ticks(0), Instant::from_ticks(100), true);
        let b = ReplayDescriptor::bounded(Instant::from_ticks(50), Instant::from_ticks(200), false);
        let i = a.intersect(&b);
        assert_eq!(i.start, Instant::from_ticks(50));
        assert_eq!(i.end, Instant::from_ticks(100));
        assert!(i.enforce_replay_clock);
    }

    #[test]
    fn replay_descriptor_all_contains_everything() {
        let d = ReplayDescriptor::all();
        assert!(d.contains(Instant::from_ticks(i64::MIN / 2)));
        assert!(d.contains(Instant::from_ticks(i64::MAX / 2)));
    }

    #[test]
    fn clock_for_replay_origin_matches_replay_start() {
        let start = Instant::from_ticks(12_345);
        let clock = Clock::for_replay(start);
        // Immediately after creation, now() should be close to the origin.
        let now = clock.now();
        assert!(now.ticks() - start.ticks() < TICKS_PER_SECOND);
    }
}
