//! Adaptive tick pacing.
//!
//! The interval between ticks grows with the number of live sources so that
//! a large fleet does not flood the accelerator with batches, and shrinks as
//! sources drop away so per-source latency stays low. It never leaves
//! `[min, max]`.

use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickBounds {
    pub min: Duration,
    pub max: Duration,
    /// Added per live source beyond the first.
    pub per_source: Duration,
}

impl TickBounds {
    /// Fixed-rate bounds (`min == max`).
    pub fn fixed(interval: Duration) -> Self {
        Self {
            min: interval,
            max: interval,
            per_source: Duration::ZERO,
        }
    }
}

/// Interval to wait before the next tick, given how many sources are live.
pub fn next_tick_interval(live_sources: usize, bounds: &TickBounds) -> Duration {
    let extra_sources = u32::try_from(live_sources.saturating_sub(1)).unwrap_or(u32::MAX);
    let target = bounds
        .per_source
        .checked_mul(extra_sources)
        .and_then(|extra| bounds.min.checked_add(extra))
        .unwrap_or(bounds.max);
    target.clamp(bounds.min, bounds.max.max(bounds.min))
}
