//! Exponential backoff with symmetric jitter.
//!
//! The math lives here so that it can be tested without a runtime. The async
//! retry loop that sleeps on these delays lives in `tether-ws`.
//!
//! - [`BackoffPolicy::grow`]: `min(max_delay, current * multiplier)`
//! - [`BackoffPolicy::jitter`]: `delay * (1 + (2r - 1) * jitter_factor)` for `r` in `[0, 1)`

use std::time::Duration;

use thiserror::Error;

/// Default first retry delay.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
/// Default cap on the retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
/// Default multiplicative growth factor.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
/// Default jitter factor (0.0–1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.1;

/// A backoff policy rejected by [`BackoffPolicy::validate`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidBackoff {
    /// The multiplier would shrink the delay or is not a finite number.
    #[error("backoff multiplier must be finite and >= 1.0, got {0}")]
    Multiplier(f64),
    /// The jitter factor is outside `[0, 1]`.
    #[error("backoff jitter factor must be within [0, 1], got {0}")]
    Jitter(f64),
    /// The initial delay is zero.
    #[error("backoff initial delay must be non-zero")]
    ZeroInitialDelay,
}

/// Parameters for exponential backoff.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for the un-jittered delay.
    pub max_delay: Duration,
    /// Growth factor applied after every failed attempt.
    pub multiplier: f64,
    /// Proportional jitter applied symmetrically around the delay.
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl BackoffPolicy {
    /// Check that the policy produces a sane, non-shrinking delay sequence.
    pub fn validate(&self) -> Result<(), InvalidBackoff> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(InvalidBackoff::Multiplier(self.multiplier));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(InvalidBackoff::Jitter(self.jitter_factor));
        }
        if self.initial_delay.is_zero() {
            return Err(InvalidBackoff::ZeroInitialDelay);
        }
        Ok(())
    }

    /// The first delay of a fresh failure episode, already capped.
    #[must_use]
    pub fn initial(&self) -> Duration {
        self.initial_delay.min(self.max_delay)
    }

    /// Grow `current` by the multiplier, capped at `max_delay`.
    #[must_use]
    pub fn grow(&self, current: Duration) -> Duration {
        let secs = current.as_secs_f64() * self.multiplier;
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Un-jittered delay before retry number `attempt` (zero-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.initial();
        for _ in 0..attempt {
            let next = self.grow(delay);
            if next == delay {
                break;
            }
            delay = next;
        }
        delay
    }

    /// Apply jitter to `delay` using `random` in `[0.0, 1.0)`.
    ///
    /// Maps `random` onto `[-jitter_factor, +jitter_factor]`, so a factor of
    /// 0.1 varies the delay by ±10%.
    #[must_use]
    pub fn jitter(&self, delay: Duration, random: f64) -> Duration {
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        let scale = 1.0 + (random * 2.0 - 1.0) * self.jitter_factor;
        let secs = (delay.as_secs_f64() * scale).max(0.0);
        Duration::try_from_secs_f64(secs).unwrap_or(delay)
    }

    /// Apply jitter using the thread-local RNG.
    #[must_use]
    pub fn jitter_random(&self, delay: Duration) -> Duration {
        self.jitter(delay, rand::random::<f64>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy(initial_ms: u64, max_ms: u64, multiplier: f64) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn defaults_validate() {
        assert!(BackoffPolicy::default().validate().is_ok());
    }

    #[test]
    fn rejects_shrinking_multiplier() {
        let p = policy(100, 1000, 0.5);
        assert_eq!(p.validate(), Err(InvalidBackoff::Multiplier(0.5)));
    }

    #[test]
    fn rejects_out_of_range_jitter() {
        let p = BackoffPolicy {
            jitter_factor: 1.5,
            ..BackoffPolicy::default()
        };
        assert_eq!(p.validate(), Err(InvalidBackoff::Jitter(1.5)));
    }

    #[test]
    fn rejects_zero_initial_delay() {
        let p = policy(0, 1000, 2.0);
        assert_eq!(p.validate(), Err(InvalidBackoff::ZeroInitialDelay));
    }

    #[test]
    fn doubles_until_cap() {
        let p = policy(100, 1000, 2.0);
        let delays: Vec<u128> = (0..6).map(|a| p.delay_for_attempt(a).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn initial_is_capped_by_max() {
        let p = policy(5000, 1000, 2.0);
        assert_eq!(p.initial(), Duration::from_millis(1000));
    }

    #[test]
    fn grow_saturates_on_huge_values() {
        let p = policy(1, 3_600_000, 1e300);
        let grown = p.grow(Duration::from_secs(60));
        assert_eq!(grown, p.max_delay);
    }

    #[test]
    fn jitter_bounds() {
        let p = BackoffPolicy {
            jitter_factor: 0.2,
            ..policy(1000, 10_000, 2.0)
        };
        let base = Duration::from_millis(1000);
        assert_eq!(p.jitter(base, 0.0), Duration::from_millis(800));
        assert_eq!(p.jitter(base, 0.5), Duration::from_millis(1000));
        assert!(p.jitter(base, 0.999_999) <= Duration::from_millis(1200));
    }

    #[test]
    fn zero_jitter_is_identity() {
        let p = policy(100, 1000, 2.0);
        let d = Duration::from_millis(321);
        assert_eq!(p.jitter_random(d), d);
    }

    proptest! {
        #[test]
        fn delay_sequence_is_non_decreasing_and_capped(
            initial in 1u64..5_000,
            max in 1u64..60_000,
            multiplier in 1.0f64..4.0,
        ) {
            let p = policy(initial, max, multiplier);
            let mut prev = Duration::ZERO;
            for attempt in 0..20 {
                let d = p.delay_for_attempt(attempt);
                prop_assert!(d >= prev);
                prop_assert!(d <= p.max_delay);
                prev = d;
            }
        }

        #[test]
        fn jitter_stays_within_factor(
            base_ms in 1u64..100_000,
            factor in 0.0f64..=1.0,
            random in 0.0f64..1.0,
        ) {
            let p = BackoffPolicy { jitter_factor: factor, ..policy(1, 200_000, 2.0) };
            let base = Duration::from_millis(base_ms);
            let jittered = p.jitter(base, random).as_secs_f64();
            let lo = base.as_secs_f64() * (1.0 - factor) - 1e-9;
            let hi = base.as_secs_f64() * (1.0 + factor) + 1e-9;
            prop_assert!(jittered >= lo && jittered <= hi);
        }
    }
}
