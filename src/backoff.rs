//! C1 — pure backoff policy: attempts -> delay seconds (spec §4.1).

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    Fixed,
    Linear,
    Exponential,
    ExpEqualJitter,
    ExpFullJitter,
}

/// `attempts <= 0` or non-positive `base`/`max` always yields 0; the
/// caller applies its own effective minimum on top. Result is always
/// clamped to `[0, max]`. Deterministic for the non-jitter policies.
pub fn delay_seconds(
    attempts: i64,
    policy: BackoffPolicy,
    base: i64,
    max: i64,
    rng: &mut impl Rng,
) -> i64 {
    if attempts <= 0 || base <= 0 || max <= 0 {
        return 0;
    }

    let exponential = exponential_value(attempts, base, max);

    let raw = match policy {
        BackoffPolicy::Fixed => base,
        BackoffPolicy::Linear => base.saturating_mul(attempts),
        BackoffPolicy::Exponential => exponential,
        BackoffPolicy::ExpEqualJitter => {
            let half = exponential / 2;
            half + rng.gen_range(0..=half.max(0))
        }
        BackoffPolicy::ExpFullJitter => {
            if exponential <= 0 {
                0
            } else {
                rng.gen_range(0..=exponential)
            }
        }
    };

    raw.clamp(0, max)
}

fn exponential_value(attempts: i64, base: i64, max: i64) -> i64 {
    // base * 2^(attempts-1), saturating before the final clamp so a large
    // attempts count can't overflow i64 on the way to being clamped down.
    let shift = (attempts - 1).clamp(0, 62) as u32;
    let factor = 1i64.checked_shl(shift).unwrap_or(i64::MAX);
    base.saturating_mul(factor).min(max.max(base))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn det_rng() -> StepRng {
        StepRng::new(0, 1)
    }

    #[test]
    fn non_positive_attempts_or_bounds_yield_zero() {
        let mut rng = det_rng();
        assert_eq!(delay_seconds(0, BackoffPolicy::Fixed, 5, 100, &mut rng), 0);
        assert_eq!(delay_seconds(-1, BackoffPolicy::Fixed, 5, 100, &mut rng), 0);
        assert_eq!(delay_seconds(3, BackoffPolicy::Fixed, 0, 100, &mut rng), 0);
        assert_eq!(delay_seconds(3, BackoffPolicy::Fixed, 5, 0, &mut rng), 0);
    }

    #[test]
    fn fixed_policy_always_returns_base_clamped() {
        let mut rng = det_rng();
        assert_eq!(delay_seconds(1, BackoffPolicy::Fixed, 5, 100, &mut rng), 5);
        assert_eq!(delay_seconds(10, BackoffPolicy::Fixed, 5, 100, &mut rng), 5);
        // base above max clamps down.
        assert_eq!(delay_seconds(1, BackoffPolicy::Fixed, 500, 100, &mut rng), 100);
    }

    #[test]
    fn linear_policy_scales_with_attempts_and_caps_at_max() {
        let mut rng = det_rng();
        assert_eq!(delay_seconds(1, BackoffPolicy::Linear, 10, 100, &mut rng), 10);
        assert_eq!(delay_seconds(3, BackoffPolicy::Linear, 10, 100, &mut rng), 30);
        assert_eq!(delay_seconds(50, BackoffPolicy::Linear, 10, 100, &mut rng), 100);
    }

    #[test]
    fn exponential_policy_doubles_per_attempt_and_caps() {
        let mut rng = det_rng();
        assert_eq!(delay_seconds(1, BackoffPolicy::Exponential, 1, 1000, &mut rng), 1);
        assert_eq!(delay_seconds(2, BackoffPolicy::Exponential, 1, 1000, &mut rng), 2);
        assert_eq!(delay_seconds(3, BackoffPolicy::Exponential, 1, 1000, &mut rng), 4);
        assert_eq!(delay_seconds(20, BackoffPolicy::Exponential, 1, 1000, &mut rng), 1000);
    }

    #[test]
    fn jitter_policies_stay_within_bounds() {
        let mut rng = rand::thread_rng();
        for attempts in 1..10 {
            let eq = delay_seconds(attempts, BackoffPolicy::ExpEqualJitter, 2, 60, &mut rng);
            assert!((0..=60).contains(&eq));
            let full = delay_seconds(attempts, BackoffPolicy::ExpFullJitter, 2, 60, &mut rng);
            assert!((0..=60).contains(&full));
        }
    }
}
