//! Laplace mechanism.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::{PrivacyError, Result};

/// Adds Laplace noise calibrated to `sensitivity / epsilon`.
///
/// Smaller `epsilon` means stronger privacy and larger noise.
pub struct DifferentialPrivacy {
    epsilon: f64,
    rng: Mutex<StdRng>,
}

impl DifferentialPrivacy {
    pub fn new(epsilon: f64) -> Result<Self> {
        Self::with_rng(epsilon, StdRng::from_entropy())
    }

    /// Deterministic noise stream, for reproducible simulations and tests.
    pub fn with_seed(epsilon: f64, seed: u64) -> Result<Self> {
        Self::with_rng(epsilon, StdRng::seed_from_u64(seed))
    }

    fn with_rng(epsilon: f64, rng: StdRng) -> Result<Self> {
        if !(epsilon.is_finite() && epsilon > 0.0) {
            return Err(PrivacyError::InvalidEpsilon(epsilon));
        }
        Ok(Self {
            epsilon,
            rng: Mutex::new(rng),
        })
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Laplace scale `b` for a query of the given sensitivity.
    pub fn scale(&self, sensitivity: f64) -> f64 {
        sensitivity.abs() / self.epsilon
    }

    /// One draw from Laplace(0, `scale`) by inverse-CDF sampling.
    pub fn sample_laplace(&self, scale: f64) -> f64 {
        if scale == 0.0 {
            return 0.0;
        }
        let u: f64 = self.rng.lock().gen_range(-0.5..0.5);
        // u = -0.5 would put ln(0) in the tail.
        let tail = (1.0 - 2.0 * u.abs()).max(f64::MIN_POSITIVE);
        -scale * u.signum() * tail.ln()
    }

    pub fn add_noise(&self, value: f64, sensitivity: f64) -> f64 {
        value + self.sample_laplace(self.scale(sensitivity))
    }

    /// Noised count, rounded and floored at zero.
    pub fn privatize_count(&self, count: u64, sensitivity: f64) -> i64 {
        let noised = self.add_noise(count as f64, sensitivity).round();
        if noised <= 0.0 {
            0
        } else {
            noised as i64
        }
    }

    /// Noised rate, clamped to `[0, 1]`.
    pub fn privatize_rate(&self, rate: f64, sensitivity: f64) -> f64 {
        let noised = self.add_noise(rate, sensitivity);
        if noised.is_nan() {
            return 0.0;
        }
        noised.clamp(0.0, 1.0)
    }
}

impl std::fmt::Debug for DifferentialPrivacy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DifferentialPrivacy")
            .field("epsilon", &self.epsilon)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn mean_abs_noise(dp: &DifferentialPrivacy, sensitivity: f64, trials: usize) -> f64 {
        (0..trials)
            .map(|_| dp.add_noise(0.0, sensitivity).abs())
            .sum::<f64>()
            / trials as f64
    }

    #[test]
    fn rejects_non_positive_epsilon() {
        assert_eq!(
            DifferentialPrivacy::new(0.0).unwrap_err(),
            PrivacyError::InvalidEpsilon(0.0)
        );
        assert!(DifferentialPrivacy::new(-1.0).is_err());
        assert!(DifferentialPrivacy::new(f64::INFINITY).is_err());
    }

    #[test]
    fn noise_grows_with_sensitivity() {
        let dp = DifferentialPrivacy::with_seed(1.0, 7).unwrap();
        let small = mean_abs_noise(&dp, 0.1, 5_000);
        let large = mean_abs_noise(&dp, 10.0, 5_000);
        assert!(large > small);
        // E|X| = b for Laplace(0, b).
        assert!((large - 10.0).abs() < 1.5, "mean |noise| was {large}");
    }

    #[test]
    fn smaller_epsilon_means_more_noise() {
        let strict = DifferentialPrivacy::with_seed(0.1, 11).unwrap();
        let loose = DifferentialPrivacy::with_seed(10.0, 11).unwrap();
        assert!(mean_abs_noise(&strict, 1.0, 5_000) > mean_abs_noise(&loose, 1.0, 5_000));
    }

    #[test]
    fn zero_sensitivity_adds_nothing() {
        let dp = DifferentialPrivacy::with_seed(1.0, 3).unwrap();
        assert_eq!(dp.add_noise(4.25, 0.0), 4.25);
        assert_eq!(dp.privatize_count(12, 0.0), 12);
    }

    #[test]
    fn seeded_streams_repeat() {
        let a = DifferentialPrivacy::with_seed(1.0, 42).unwrap();
        let b = DifferentialPrivacy::with_seed(1.0, 42).unwrap();
        for _ in 0..10 {
            assert_eq!(a.add_noise(1.0, 1.0), b.add_noise(1.0, 1.0));
        }
    }

    proptest! {
        #[test]
        fn privatized_rate_stays_in_unit_interval(
            rate in -2.0f64..3.0,
            sensitivity in 0.0f64..100.0,
            epsilon in 0.01f64..10.0,
            seed in any::<u64>(),
        ) {
            let dp = DifferentialPrivacy::with_seed(epsilon, seed).unwrap();
            let noised = dp.privatize_rate(rate, sensitivity);
            prop_assert!((0.0..=1.0).contains(&noised));
        }

        #[test]
        fn privatized_count_is_never_negative(
            count in 0u64..1_000,
            sensitivity in 0.0f64..50.0,
            seed in any::<u64>(),
        ) {
            let dp = DifferentialPrivacy::with_seed(0.5, seed).unwrap();
            prop_assert!(dp.privatize_count(count, sensitivity) >= 0);
        }
    }
}
