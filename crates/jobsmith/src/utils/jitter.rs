//! Symmetric jitter for retry delays
//!
//! Delays are spread evenly around their nominal value so that a burst of
//! jobs failing together does not retry in lockstep.

use rand::Rng;
use std::time::Duration;

/// Draw a uniform sample from `[-1.0, 1.0]`
pub fn unit_sample() -> f64 {
    rand::rng().random_range(-1.0..=1.0)
}

/// Apply symmetric jitter to `delay` using a pre-drawn `sample` in `[-1, 1]`
///
/// Returns `max(0, delay + delay * jitter_factor * sample)`. Both the factor and
/// the sample are clamped to their documented ranges.
///
/// # Examples
/// ```
/// use std::time::Duration;
/// use jobsmith::utils::jitter::jittered;
///
/// let d = jittered(Duration::from_secs(10), 0.5, -1.0);
/// assert_eq!(d, Duration::from_secs(5));
/// ```
pub fn jittered(delay: Duration, jitter_factor: f64, sample: f64) -> Duration {
    let factor = jitter_factor.clamp(0.0, 1.0);
    let sample = sample.clamp(-1.0, 1.0);
    let base = delay.as_secs_f64();
    let adjusted = (base + base * factor * sample).max(0.0);
    Duration::try_from_secs_f64(adjusted).unwrap_or(Duration::MAX)
}

/// Apply symmetric jitter to `delay` with a freshly drawn sample
pub fn apply_jitter(delay: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || delay.is_zero() {
        return delay;
    }
    jittered(delay, jitter_factor, unit_sample())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_zero_factor_is_identity() {
        assert_eq!(apply_jitter(Duration::from_millis(750), 0.0), Duration::from_millis(750));
    }

    #[test]
    fn test_extremes() {
        let base = Duration::from_secs(4);
        assert_eq!(jittered(base, 1.0, -1.0), Duration::ZERO);
        assert_eq!(jittered(base, 1.0, 1.0), Duration::from_secs(8));
        assert_eq!(jittered(base, 0.25, 0.0), base);
    }

    #[test]
    fn test_samples_vary() {
        let delays: Vec<_> = (0..20)
            .map(|_| apply_jitter(Duration::from_secs(10), 0.5))
            .collect();
        assert!(delays.windows(2).any(|w| w[0] != w[1]), "Jitter should produce different delays");
    }

    proptest! {
        #[test]
        fn test_jitter_stays_within_band(
            millis in 0u64..1_000_000,
            factor in 0.0f64..=1.0,
        ) {
            let base = Duration::from_millis(millis);
            let d = apply_jitter(base, factor);
            let upper = base.as_secs_f64() * (1.0 + factor);
            let lower = base.as_secs_f64() * (1.0 - factor);
            prop_assert!(d.as_secs_f64() <= upper + 1e-9);
            prop_assert!(d.as_secs_f64() >= lower - 1e-9);
        }
    }
}
