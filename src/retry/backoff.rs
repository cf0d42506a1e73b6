use rand::Rng;
use std::time::Duration;

/// Trait defining backoff behavior
pub trait Backoff: Send + Sync {
    /// Delay to apply before the given attempt (1-based).
    fn next_delay(&self, attempt: u32) -> Duration;
}

/// Fixed delay regardless of attempt count. The store adapter uses this for
/// its throttled-retry loop.
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Backoff for FixedBackoff {
    fn next_delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Linearly growing delay, capped at a maximum. The pull reader's retry table
/// is `min(max, attempt * step)`.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    step: Duration,
    max: Duration,
}

impl LinearBackoff {
    pub fn new(step: Duration, max: Duration) -> Self {
        Self { step, max }
    }

    /// Whether the uncapped delay for this attempt has grown past the
    /// maximum. Callers treat this as the give-up signal.
    pub fn saturated(&self, attempt: u32) -> bool {
        self.step * attempt > self.max
    }
}

impl Backoff for LinearBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        (self.step * attempt).min(self.max)
    }
}

/// Capped exponential backoff with full jitter, used for producer publish
/// retries.
///
/// The bound doubles from `base` each attempt up to `cap`, and the actual
/// delay is drawn uniformly from zero to that bound, so publishers that
/// failed together do not retry in lockstep.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    fn bound(&self, attempt: u32) -> Duration {
        // Shifts past 2^16 are already beyond any sane cap.
        let exponent = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exponent).min(self.cap)
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        let bound_ms = self.bound(attempt).as_millis() as u64;
        if bound_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=bound_ms))
    }
}
