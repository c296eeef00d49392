//! Synthetic sparse regression problems with a known generating model.
//!
//! All randomness comes from the caller's generator, so a seeded `StdRng`
//! reproduces a dataset exactly.

use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::Rng;
use rand_distr::{Distribution, Normal, StandardNormal};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SynthDataError {
    #[error("Omission probability must lie in [0, 1], got {0}.")]
    InvalidOmissionProbability(f64),

    #[error("Emission variance must be finite and strictly positive, got {0}.")]
    InvalidEmissionVariance(f64),

    #[error("Dimension mismatch in {context}: expected {expected}, found {found}.")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },
}

/// Draws which basis functions take part in the generating model.
///
/// Each entry is independently `false` with probability `probability_of_omission`.
pub fn generate_mask<R: Rng + ?Sized>(
    num_basis: usize,
    probability_of_omission: f64,
    rng: &mut R,
) -> Result<Array1<bool>, SynthDataError> {
    if !(0.0..=1.0).contains(&probability_of_omission) {
        return Err(SynthDataError::InvalidOmissionProbability(
            probability_of_omission,
        ));
    }
    let keep = 1.0 - probability_of_omission;
    Ok(Array1::from_shape_fn(num_basis, |_| rng.gen_bool(keep)))
}

/// Standard normal weights, zeroed wherever the mask is `false`.
///
/// A weight is drawn for every basis function, masked or not, so the same seed
/// gives the same surviving weights whatever the mask.
pub fn generate_weights<R: Rng + ?Sized>(
    num_basis: usize,
    mask: ArrayView1<bool>,
    rng: &mut R,
) -> Result<Array1<f64>, SynthDataError> {
    if mask.len() != num_basis {
        return Err(SynthDataError::DimensionMismatch {
            context: "mask vs number of basis functions",
            expected: num_basis,
            found: mask.len(),
        });
    }
    let draws: Array1<f64> = Array1::from_shape_fn(num_basis, |_| StandardNormal.sample(rng));
    Ok(Array1::from_shape_fn(num_basis, |m| {
        if mask[m] { draws[m] } else { 0.0 }
    }))
}

/// Observations `y = X w + e` with `e ~ N(0, emission_variance I)`.
pub fn generate_observations<R: Rng + ?Sized>(
    design: ArrayView2<f64>,
    weights: ArrayView1<f64>,
    emission_variance: f64,
    rng: &mut R,
) -> Result<Array1<f64>, SynthDataError> {
    if design.ncols() != weights.len() {
        return Err(SynthDataError::DimensionMismatch {
            context: "weights vs design columns",
            expected: design.ncols(),
            found: weights.len(),
        });
    }
    if !(emission_variance.is_finite() && emission_variance > 0.0) {
        return Err(SynthDataError::InvalidEmissionVariance(emission_variance));
    }
    let noise = Normal::new(0.0, emission_variance.sqrt())
        .map_err(|_| SynthDataError::InvalidEmissionVariance(emission_variance))?;

    let mut y = design.dot(&weights);
    y.mapv_inplace(|mean| mean + noise.sample(rng));
    Ok(y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_same_seed_same_dataset() {
        let design = Array2::from_shape_fn((20, 3), |(i, j)| (i + j) as f64 * 0.1);
        let draw = |seed: u64| {
            let mut rng = StdRng::seed_from_u64(seed);
            let mask = generate_mask(3, 0.25, &mut rng).unwrap();
            let weights = generate_weights(3, mask.view(), &mut rng).unwrap();
            let y = generate_observations(design.view(), weights.view(), 1e-4, &mut rng).unwrap();
            (mask, weights, y)
        };
        assert_eq!(draw(42), draw(42));
    }

    #[test]
    fn test_masked_weights_are_zero() {
        let mut rng = StdRng::seed_from_u64(7);
        let mask = array![true, false, true, false, true];
        let weights = generate_weights(5, mask.view(), &mut rng).unwrap();
        assert_eq!(weights[1], 0.0);
        assert_eq!(weights[3], 0.0);
        assert!(weights[0] != 0.0 && weights[2] != 0.0 && weights[4] != 0.0);
    }

    #[test]
    fn test_omission_probability_extremes() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(generate_mask(50, 0.0, &mut rng).unwrap().iter().all(|&k| k));
        assert!(generate_mask(50, 1.0, &mut rng).unwrap().iter().all(|&k| !k));
        assert!(matches!(
            generate_mask(5, 1.5, &mut rng),
            Err(SynthDataError::InvalidOmissionProbability(_))
        ));
    }

    #[test]
    fn test_noise_scale_follows_emission_variance() {
        let mut rng = StdRng::seed_from_u64(3);
        let design = Array2::from_elem((4000, 1), 1.0);
        let weights = array![2.0];
        let y = generate_observations(design.view(), weights.view(), 1e-4, &mut rng).unwrap();
        let residual = y.mapv(|v| v - 2.0);
        let variance = residual.dot(&residual) / 4000.0;
        assert!(
            (0.8e-4..1.2e-4).contains(&variance),
            "empirical noise variance {variance} far from 1e-4"
        );
    }

    #[test]
    fn test_invalid_observation_inputs() {
        let mut rng = StdRng::seed_from_u64(3);
        let design = array![[1.0, 0.0], [0.0, 1.0]];
        assert!(matches!(
            generate_observations(design.view(), array![1.0].view(), 1.0, &mut rng),
            Err(SynthDataError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            generate_observations(design.view(), array![1.0, 1.0].view(), -1.0, &mut rng),
            Err(SynthDataError::InvalidEmissionVariance(_))
        ));
        assert!(matches!(
            generate_observations(design.view(), array![1.0, 1.0].view(), 0.0, &mut rng),
            Err(SynthDataError::InvalidEmissionVariance(_))
        ));
    }
}
