//! Reconnect delay: initial timeout × backoff coefficient × jitter.

use std::time::Duration;

use rand::Rng;

/// Grows by a third per attempt, capped at 2: 1, 4/3, 5/3, 2, 2, ...
pub fn backoff_coefficient(attempt: u32) -> f64 {
    ((f64::from(attempt.max(1)) + 2.0) / 3.0).min(2.0)
}

/// Uniform in `[0.8, 1.0]`.
pub fn jitter_coefficient<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    rng.gen_range(0.8..=1.0)
}

/// Delay before retry number `attempt` (1-based).
pub fn retry_delay<R: Rng + ?Sized>(initial: Duration, attempt: u32, rng: &mut R) -> Duration {
    initial.mul_f64(backoff_coefficient(attempt) * jitter_coefficient(rng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn coefficient_grows_then_caps() {
        let coefficients: Vec<f64> = (1..=6).map(backoff_coefficient).collect();
        assert_eq!(coefficients[0], 1.0);
        assert!((coefficients[1] - 4.0 / 3.0).abs() < 1e-9);
        assert!((coefficients[2] - 5.0 / 3.0).abs() < 1e-9);
        assert_eq!(coefficients[3], 2.0);
        assert_eq!(coefficients[5], 2.0);
    }

    #[test]
    fn delay_stays_within_jitter_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let initial = Duration::from_secs(15);
        for attempt in 1..50 {
            let delay = retry_delay(initial, attempt, &mut rng);
            let upper = initial.mul_f64(backoff_coefficient(attempt));
            let lower = upper.mul_f64(0.8);
            assert!(delay <= upper, "attempt {attempt}: {delay:?} > {upper:?}");
            assert!(delay >= lower, "attempt {attempt}: {delay:?} < {lower:?}");
        }
    }

    #[test]
    fn seeded_generator_is_deterministic() {
        let initial = Duration::from_secs(1);
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        let first: Vec<Duration> = (1..10).map(|n| retry_delay(initial, n, &mut a)).collect();
        let second: Vec<Duration> = (1..10).map(|n| retry_delay(initial, n, &mut b)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn attempt_zero_treated_as_first() {
        assert_eq!(backoff_coefficient(0), backoff_coefficient(1));
    }
}
