//! Time-window interpolation and stream fusion.
//!
//! An interpolator computes a value for a primary-stream instant from a
//! time-ordered view of a secondary stream's already-delivered messages.
//! Callers supply that view as a `VecDeque` ordered by originating time
//! (guaranteed by a single receiver's delivery order); [`Interpolator::evaluate`]
//! trims it of messages made obsolete by a returned match.

use std::collections::VecDeque;

use crate::error::{ChronopipeError, ChronopipeResult};
use crate::message::Message;
use crate::time::{Instant, TickDelta};

/// Which in-window message an interpolator selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// The earliest in-window message.
    First,
    /// The latest in-window message.
    Last,
    /// The in-window message minimizing distance to the primary time.
    Nearest,
    /// `Nearest` with a zero-width window.
    Exact,
}

/// A relative time interval `[t+left, t+right]` with independent endpoint
/// inclusivity, evaluated relative to a primary instant `t`.
#[derive(Debug, Clone, Copy)]
pub struct WindowSpec {
    left: TickDelta,
    left_inclusive: bool,
    right: TickDelta,
    right_inclusive: bool,
}

impl WindowSpec {
    /// Builds a window with explicit bounds and inclusivity.
    #[must_use]
    pub const fn new(left: TickDelta, left_inclusive: bool, right: TickDelta, right_inclusive: bool) -> Self {
        Self {
            left,
            left_inclusive,
            right,
            right_inclusive,
        }
    }

    /// A zero-width window `[t, t]`, for `exact` matching.
    #[must_use]
    pub const fn exact() -> Self {
        Self::new(TickDelta::ZERO, true, TickDelta::ZERO, true)
    }

    /// An unbounded-left window `(-inf, t+right]`/`[t+right)`. Rejected at
    /// [`Interpolator`] construction for `first`.
    #[must_use]
    pub const fn unbounded_left(right: TickDelta, right_inclusive: bool) -> Self {
        Self::new(TickDelta::from_ticks(i64::MIN), false, right, right_inclusive)
    }

    fn is_left_unbounded(&self) -> bool {
        self.left.ticks() == i64::MIN
    }

    fn bounds_at(&self, t: Instant) -> (Instant, Instant) {
        (t + self.left, t + self.right)
    }

    fn contains(&self, t: Instant, msg_time: Instant) -> bool {
        let (lo, hi) = self.bounds_at(t);
        let left_ok = if self.left_inclusive { msg_time >= lo } else { msg_time > lo };
        let right_ok = if self.right_inclusive { msg_time <= hi } else { msg_time < hi };
        left_ok && right_ok
    }
}

/// Outcome of evaluating an interpolator against a secondary stream view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterpolationResult<T> {
    /// A message was found and matched the window/kind criteria.
    Matched(T),
    /// A reproducible interpolator cannot yet prove no better future
    /// message can arrive; the caller must wait for more secondary
    /// messages or stream closure.
    InsufficientData,
    /// No message matched and no default was configured.
    NotFound,
    /// No message matched; the configured default is returned.
    Default(T),
}

/// A pure function computing a fused value at a primary instant from a
/// secondary stream's time-ordered queue.
///
/// `reproducible = true` yields a result depending only on originating
/// times (may return [`InterpolationResult::InsufficientData`] and ask the
/// caller to wait); `reproducible = false` ("greedy") decides immediately
/// from whatever is currently queued.
#[derive(Debug, Clone)]
pub struct Interpolator<T> {
    kind: MatchKind,
    window: WindowSpec,
    reproducible: bool,
    default: Option<T>,
}

impl<T> Interpolator<T>
where
    T: Clone,
{
    /// Constructs an interpolator. Fails with
    /// [`ChronopipeError::InvalidInterpolator`] if `kind` is `first` and
    /// `window` has an unbounded left endpoint.
    pub fn new(kind: MatchKind, window: WindowSpec, reproducible: bool, default: Option<T>) -> ChronopipeResult<Self> {
        if kind == MatchKind::First && window.is_left_unbounded() {
            return Err(ChronopipeError::InvalidInterpolator(
                "first requires a bounded left endpoint".to_string(),
            ));
        }
        Ok(Self {
            kind,
            window: if kind == MatchKind::Exact { WindowSpec::exact() } else { window },
            reproducible,
            default,
        })
    }

    /// True if this interpolator waits for provable finality rather than
    /// deciding immediately from what is currently queued.
    #[must_use]
    pub fn is_reproducible(&self) -> bool {
        self.reproducible
    }

    /// Evaluates this interpolator at `primary_time` against `queue`,
    /// discarding messages made obsolete by a returned match (every message
    /// strictly before the match's originating time).
    pub fn evaluate(
        &self,
        queue: &mut VecDeque<Message<T>>,
        primary_time: Instant,
        secondary_closed: bool,
    ) -> InterpolationResult<T> {
        let (_, hi) = self.window.bounds_at(primary_time);
        let last_seen = queue.back().map(Message::originating_time);
        let exhausted = secondary_closed
            || last_seen.is_some_and(|t| {
                t > hi || (self.window.right_inclusive && t == hi && matches!(self.kind, MatchKind::Last))
            });

        let mut best_idx: Option<usize> = None;
        let mut best_dist = u64::MAX;
        for (i, m) in queue.iter().enumerate() {
            let t = m.originating_time();
            if self.window.contains(primary_time, t) {
                match self.kind {
                    MatchKind::First => {
                        best_idx = Some(i);
                        break;
                    }
                    MatchKind::Last => {
                        best_idx = Some(i);
                    }
                    MatchKind::Nearest | MatchKind::Exact => {
                        let dist = t.abs_diff_ticks(primary_time);
                        if best_idx.is_none() || dist <= best_dist {
                            best_dist = dist;
                            best_idx = Some(i);
                        } else {
                            break;
                        }
                    }
                }
            } else if t > hi {
                break;
            }
        }

        if let Some(idx) = best_idx {
            if self.reproducible && !exhausted {
                return InterpolationResult::InsufficientData;
            }
            let match_time = queue[idx].originating_time();
            let payload = queue[idx].payload.clone();
            while queue.front().is_some_and(|m| m.originating_time() < match_time) {
                queue.pop_front();
            }
            return InterpolationResult::Matched(payload);
        }

        if self.reproducible && !exhausted {
            return InterpolationResult::InsufficientData;
        }
        match &self.default {
            Some(d) => InterpolationResult::Default(d.clone()),
            None => InterpolationResult::NotFound,
        }
    }
}

/// Adds one tick to `candidate` if it does not strictly exceed `last_emitted`,
/// guaranteeing the strictly-increasing originating-time invariant required
/// of any operator that emits based on interpolation results.
#[must_use]
pub fn correct_monotonic(candidate: Instant, last_emitted: Option<Instant>) -> Instant {
    match last_emitted {
        Some(last) if candidate <= last => last.next_tick(),
        _ => candidate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;

    fn msg(tick: i64, value: i32) -> Message<i32> {
        Message::new(value, Envelope::new(0, tick as u64, Instant::from_ticks(tick), Instant::from_ticks(tick)))
    }

    #[test]
    fn first_rejects_unbounded_left() {
        let err = Interpolator::<i32>::new(
            MatchKind::First,
            WindowSpec::unbounded_left(TickDelta::from_ticks(5), true),
            true,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ChronopipeError::InvalidInterpolator(_)));
    }

    #[test]
    fn reproducible_nearest_waits_until_provably_final() {
        let interp = Interpolator::new(
            MatchKind::Nearest,
            WindowSpec::new(TickDelta::from_ticks(-15), true, TickDelta::from_ticks(15), false),
            true,
            None,
        )
        .unwrap();

        let mut queue: VecDeque<Message<i32>> = VecDeque::new();
        queue.push_back(msg(10, 100));
        queue.push_back(msg(25, 250));
        let result = interp.evaluate(&mut queue, Instant::from_ticks(20), false);
        assert_eq!(result, InterpolationResult::InsufficientData);

        queue.push_back(msg(40, 400));
        let result = interp.evaluate(&mut queue, Instant::from_ticks(20), false);
        assert_eq!(result, InterpolationResult::Matched(250));
    }

    #[test]
    fn greedy_decides_immediately_without_waiting() {
        let interp = Interpolator::new(
            MatchKind::Nearest,
            WindowSpec::new(TickDelta::from_ticks(-15), true, TickDelta::from_ticks(15), false),
            false,
            None,
        )
        .unwrap();
        let mut queue: VecDeque<Message<i32>> = VecDeque::new();
        queue.push_back(msg(10, 100));
        queue.push_back(msg(25, 250));
        let result = interp.evaluate(&mut queue, Instant::from_ticks(20), false);
        assert_eq!(result, InterpolationResult::Matched(250));
    }

    #[test]
    fn match_discards_obsolete_predecessors() {
        let interp = Interpolator::new(MatchKind::Last, WindowSpec::exact(), false, None).unwrap();
        let mut queue: VecDeque<Message<i32>> = VecDeque::new();
        queue.push_back(msg(5, 5));
        queue.push_back(msg(10, 10));
        queue.push_back(msg(15, 15));
        let _ = interp.evaluate(&mut queue, Instant::from_ticks(10), true);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.front().unwrap().originating_time(), Instant::from_ticks(10));
    }

    #[test]
    fn no_messages_and_not_closed_is_insufficient_data() {
        let interp = Interpolator::new(MatchKind::Nearest, WindowSpec::exact(), true, None).unwrap();
        let mut queue: VecDeque<Message<i32>> = VecDeque::new();
        let result = interp.evaluate(&mut queue, Instant::from_ticks(10), false);
        assert_eq!(result, InterpolationResult::InsufficientData);
    }

    #[test]
    fn no_messages_and_closed_falls_back_to_default() {
        let interp = Interpolator::new(MatchKind::Nearest, WindowSpec::exact(), true, Some(-1)).unwrap();
        let mut queue: VecDeque<Message<i32>> = VecDeque::new();
        let result = interp.evaluate(&mut queue, Instant::from_ticks(10), true);
        assert_eq!(result, InterpolationResult::Default(-1));
    }

    #[test]
    fn monotonic_correction_bumps_non_increasing_candidate() {
        let last = Instant::from_ticks(100);
        assert_eq!(correct_monotonic(Instant::from_ticks(100), Some(last)), Instant::from_ticks(101));
        assert_eq!(correct_monotonic(Instant::from_ticks(99), Some(last)), Instant::from_ticks(101));
        assert_eq!(correct_monotonic(Instant::from_ticks(150), Some(last)), Instant::from_ticks(150));
    }
}
