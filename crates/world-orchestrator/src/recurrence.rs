//! Next-occurrence calculation for cyclic events.
//!
//! Occurrences sit on a fixed phase grid `start + k * cycle`. After any
//! amount of downtime the next occurrence is found by jumping straight to the
//! first grid point at or after "now"; missed occurrences are absorbed, never
//! replayed. Jitter is sampled fresh for every call and never moves the grid.

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use std::time::Duration;

use crate::event::CyclicEventMetadata;

const NANOS_PER_SEC: i128 = 1_000_000_000;

/// A computed occurrence of a cyclic event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    /// Grid point the occurrence belongs to (`start + k * cycle`).
    pub phase: DateTime<Utc>,
    /// When the occurrence fires: `phase` plus the sampled jitter.
    pub at: DateTime<Utc>,
}

/// Compute the next occurrence of `metadata` at or after `now`.
///
/// Returns `None` when the event is not cyclic, its window has closed, or the
/// next jittered occurrence would land past `end_time`.
pub fn next_occurrence<R: Rng + ?Sized>(
    metadata: &CyclicEventMetadata,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Option<Occurrence> {
    if now > metadata.end_time || !metadata.is_cyclic() {
        return None;
    }
    let phase = phase_at_or_after(metadata.start_time, metadata.cycle, now)?;
    let at = phase.checked_add_signed(sample_jitter(metadata.random_jitter, rng))?;
    if at > metadata.end_time {
        return None;
    }
    Some(Occurrence { phase, at })
}

/// Compute the occurrence that follows `previous` once it has fired.
///
/// The search starts one cycle after the previous grid point, or at `now` if
/// the firing ran late, so a firing can never select its own grid point again.
pub fn next_after_firing<R: Rng + ?Sized>(
    metadata: &CyclicEventMetadata,
    previous: &Occurrence,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Option<Occurrence> {
    let cycle = TimeDelta::from_std(metadata.cycle).ok()?;
    let following = previous.phase.checked_add_signed(cycle)?;
    next_occurrence(metadata, now.max(following), rng)
}

/// First grid point `start + k * cycle` (k >= 0) that is not before `now`.
fn phase_at_or_after(
    start: DateTime<Utc>,
    cycle: Duration,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if now <= start {
        return Some(start);
    }
    let elapsed = now - start;
    let elapsed_nanos =
        i128::from(elapsed.num_seconds()) * NANOS_PER_SEC + i128::from(elapsed.subsec_nanos());
    let cycle_nanos = i128::try_from(cycle.as_nanos()).ok()?;
    let cycles = (elapsed_nanos + cycle_nanos - 1) / cycle_nanos;
    start.checked_add_signed(delta_from_nanos(cycles * cycle_nanos)?)
}

fn delta_from_nanos(nanos: i128) -> Option<TimeDelta> {
    let secs = i64::try_from(nanos / NANOS_PER_SEC).ok()?;
    let rem = i64::try_from(nanos % NANOS_PER_SEC).ok()?;
    TimeDelta::try_seconds(secs)?.checked_add(&TimeDelta::nanoseconds(rem))
}

/// Uniform offset in `[0, bound)` at millisecond resolution.
fn sample_jitter<R: Rng + ?Sized>(bound: Duration, rng: &mut R) -> TimeDelta {
    let bound_ms = u64::try_from(bound.as_millis()).unwrap_or(u64::MAX);
    if bound_ms == 0 {
        return TimeDelta::zero();
    }
    let offset = rng.gen_range(0..bound_ms);
    TimeDelta::milliseconds(i64::try_from(offset).unwrap_or(i64::MAX))
}
