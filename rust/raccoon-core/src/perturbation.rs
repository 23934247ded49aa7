//! Perturbation of deltas before they leave a client.
//!
//! Every scalar of a delta receives independent zero-mean Gaussian noise. The noise is drawn anew
//! on each call, so perturbing the same delta twice yields two different results. The coordinator
//! never inspects nor removes the noise.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};
use thiserror::Error;

use crate::weights::Delta;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
/// Errors related to the perturbation of deltas.
pub enum PerturbationError {
    #[error("invalid noise standard deviation {0}: it must be finite and non-negative")]
    InvalidNoise(f32),
}

/// Perturbs a delta with Gaussian noise of standard deviation `noise_std`, drawn from the thread
/// local RNG.
///
/// # Errors
/// Fails if `noise_std` is negative or not finite.
pub fn perturb(delta: Delta, noise_std: f32) -> Result<Delta, PerturbationError> {
    perturb_with(delta, noise_std, &mut rand::thread_rng())
}

/// Perturbs a delta with Gaussian noise of standard deviation `noise_std`, drawn from `rng`.
///
/// A standard deviation of `0` returns the delta unchanged.
///
/// # Errors
/// Fails if `noise_std` is negative or not finite.
pub fn perturb_with<R: Rng + ?Sized>(
    delta: Delta,
    noise_std: f32,
    rng: &mut R,
) -> Result<Delta, PerturbationError> {
    Ok(match noise(noise_std)? {
        Some(normal) => add_noise(delta, &normal, rng),
        None => delta,
    })
}

/// Builds the noise distribution, or `None` if there is no noise to add.
fn noise(noise_std: f32) -> Result<Option<Normal<f32>>, PerturbationError> {
    if !noise_std.is_finite() || noise_std < 0. {
        return Err(PerturbationError::InvalidNoise(noise_std));
    }
    if noise_std == 0. {
        return Ok(None);
    }
    Normal::new(0., noise_std)
        .map(Some)
        .map_err(|_| PerturbationError::InvalidNoise(noise_std))
}

fn add_noise<R: Rng + ?Sized>(delta: Delta, normal: &Normal<f32>, rng: &mut R) -> Delta {
    delta
        .into_inner()
        .into_iter()
        .map(|mut tensor| {
            tensor.map_inplace(|scalar| *scalar += normal.sample(&mut *rng));
            tensor
        })
        .collect()
}

#[derive(Debug, Clone)]
/// A configured perturbation step with its own random number generator.
pub struct GaussianPerturbation<R = ChaCha20Rng> {
    noise_std: f32,
    normal: Option<Normal<f32>>,
    rng: R,
}

impl GaussianPerturbation {
    /// Creates a perturbation step seeded from system entropy.
    ///
    /// # Errors
    /// Fails if `noise_std` is negative or not finite.
    pub fn new(noise_std: f32) -> Result<Self, PerturbationError> {
        Self::with_rng(noise_std, ChaCha20Rng::from_entropy())
    }

    /// Creates a reproducible perturbation step.
    ///
    /// # Errors
    /// Fails if `noise_std` is negative or not finite.
    pub fn seeded(noise_std: f32, seed: u64) -> Result<Self, PerturbationError> {
        Self::with_rng(noise_std, ChaCha20Rng::seed_from_u64(seed))
    }
}

impl<R: Rng> GaussianPerturbation<R> {
    /// Creates a perturbation step drawing its noise from `rng`.
    ///
    /// # Errors
    /// Fails if `noise_std` is negative or not finite.
    pub fn with_rng(noise_std: f32, rng: R) -> Result<Self, PerturbationError> {
        Ok(Self {
            noise_std,
            normal: noise(noise_std)?,
            rng,
        })
    }

    /// Gets the configured standard deviation.
    pub fn noise_std(&self) -> f32 {
        self.noise_std
    }

    /// Perturbs a delta.
    pub fn perturb(&mut self, delta: Delta) -> Delta {
        match &self.normal {
            Some(normal) => add_noise(delta, normal, &mut self.rng),
            None => delta,
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::weights::WeightSet;

    fn delta() -> Delta {
        Delta::from(vec![
            array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]].into_dyn(),
            array![-1.0, 0.0, 1.0].into_dyn(),
        ])
    }

    #[test]
    fn test_zero_noise_is_identity() {
        assert_eq!(perturb(delta(), 0.).unwrap(), delta());
        assert_eq!(GaussianPerturbation::new(0.).unwrap().perturb(delta()), delta());
    }

    #[test]
    fn test_invalid_noise() {
        assert_eq!(
            perturb(delta(), -0.1).unwrap_err(),
            PerturbationError::InvalidNoise(-0.1)
        );
        assert!(perturb(delta(), f32::NAN).is_err());
        assert!(perturb(delta(), f32::INFINITY).is_err());
        assert!(GaussianPerturbation::new(-1.).is_err());
    }

    #[test]
    fn test_noise_keeps_shape() {
        let perturbed = perturb(delta(), 0.5).unwrap();
        assert_eq!(perturbed.shapes(), delta().shapes());
        assert_ne!(perturbed, delta());
    }

    #[test]
    fn test_noise_differs_per_call() {
        let mut perturbation = GaussianPerturbation::seeded(0.01, 42).unwrap();
        let first = perturbation.perturb(delta());
        let second = perturbation.perturb(delta());
        assert_ne!(first, second);
    }

    #[test]
    fn test_seeded_noise_is_reproducible() {
        let first = GaussianPerturbation::seeded(0.01, 7).unwrap().perturb(delta());
        let second = GaussianPerturbation::seeded(0.01, 7).unwrap().perturb(delta());
        assert_eq!(first, second);
    }

    #[test]
    fn test_noise_statistics() {
        let zeros = Delta::from(WeightSet::new(vec![ndarray::ArrayD::zeros(vec![100, 100])]));
        let mut perturbation = GaussianPerturbation::seeded(0.5, 1).unwrap();
        let noise = perturbation.perturb(zeros).into_inner();

        let samples = noise.tensors()[0].iter().copied().collect::<Vec<f32>>();
        let n = samples.len() as f32;
        let mean = samples.iter().sum::<f32>() / n;
        let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / n;
        assert!(mean.abs() < 0.05, "mean {}", mean);
        assert!((var.sqrt() - 0.5).abs() < 0.05, "std {}", var.sqrt());
    }
}
