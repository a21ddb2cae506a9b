//! Pluggable poll-interval policies.
//!
//! Two variants exist in production history: the canonical one decays
//! toward the floor while a source is quiet, the older one doubles toward
//! the ceiling. Both snap to the floor the moment a poll returns items.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffStrategy;

/// Bounds every computed interval is clamped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBounds {
    pub min: Duration,
    pub max: Duration,
}

impl PollBounds {
    pub fn clamp(&self, interval: Duration) -> Duration {
        interval.clamp(self.min, self.max)
    }
}

/// Computes the next poll interval from the current one and whether the last
/// poll yielded items.
pub trait BackoffPolicy: Send + Sync {
    fn next_interval(&self, current: Duration, bounds: PollBounds, got_items: bool) -> Duration;
}

/// Canonical policy: fast-poll while the source is active, decay by a third
/// per empty poll, never below the floor.
#[derive(Debug, Default, Clone, Copy)]
pub struct DecayTowardFloor;

impl BackoffPolicy for DecayTowardFloor {
    fn next_interval(&self, current: Duration, bounds: PollBounds, got_items: bool) -> Duration {
        if got_items {
            return bounds.min;
        }
        let decayed = current.saturating_sub(current / 3);
        bounds.clamp(decayed.max(bounds.min))
    }
}

/// Compatibility variant: double per empty poll up to the ceiling.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExponentialGrowth;

impl BackoffPolicy for ExponentialGrowth {
    fn next_interval(&self, current: Duration, bounds: PollBounds, got_items: bool) -> Duration {
        if got_items {
            return bounds.min;
        }
        bounds.clamp(current.saturating_mul(2))
    }
}

/// Policy selected by configuration.
pub fn policy_for(strategy: BackoffStrategy) -> Box<dyn BackoffPolicy> {
    match strategy {
        BackoffStrategy::DecayTowardFloor => Box::new(DecayTowardFloor),
        BackoffStrategy::ExponentialGrowth => Box::new(ExponentialGrowth),
    }
}

/// Actual wait = interval + random(0, interval/10), so sources never poll in
/// lockstep.
pub fn with_jitter(interval: Duration) -> Duration {
    let spread = interval.as_millis() as u64 / 10;
    if spread == 0 {
        return interval;
    }
    interval + Duration::from_millis(rand::rng().random_range(0..spread))
}
