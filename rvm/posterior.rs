//! E-step: the closed-form Gaussian posterior over the active weights.

use crate::estimate::{EmError, ensure_positive};
use crate::matrix::ensure_len;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use ndarray_linalg::Inverse;

/// Gaussian posterior over the currently active weights.
///
/// Recomputed from scratch every E-step; nothing here survives into the next
/// iteration.
#[derive(Debug, Clone)]
pub struct Posterior {
    pub mean: Array1<f64>,
    pub covariance: Array2<f64>,
}

/// Computes the posterior for a zero-mean diagonal Gaussian prior and isotropic
/// Gaussian emission noise.
///
/// With `beta = 1 / emission_variance` and `A = diag(1 / prior_variances)`:
///
/// * `covariance = (A + beta * X^T X)^-1`
/// * `mean = beta * covariance * X^T y`
///
/// The prior precision is formed elementwise; the prior covariance is diagonal
/// so no general inverse is needed for it.
///
/// # Errors
///
/// * `SingularMatrix` when the posterior precision cannot be inverted.
/// * `DimensionMismatch` when `xtx`, `xty` and `prior_variances` disagree.
/// * `InvalidHyperparameter` when a variance is not finite and positive.
pub fn obtain_posterior(
    xtx: ArrayView2<f64>,
    xty: ArrayView1<f64>,
    prior_variances: ArrayView1<f64>,
    emission_variance: f64,
) -> Result<Posterior, EmError> {
    let m = prior_variances.len();
    ensure_len("X^T X rows vs active weights", m, xtx.nrows())?;
    ensure_len("X^T X columns vs active weights", m, xtx.ncols())?;
    ensure_len("X^T y length vs active weights", m, xty.len())?;

    ensure_positive("emission_variance", emission_variance)?;
    for (idx, &variance) in prior_variances.indexed_iter() {
        ensure_positive(&format!("prior_variance[{idx}]"), variance)?;
    }

    // Every weight has been pruned; the posterior is over an empty vector.
    if m == 0 {
        return Ok(Posterior {
            mean: Array1::zeros(0),
            covariance: Array2::zeros((0, 0)),
        });
    }

    let emission_precision = 1.0 / emission_variance;
    let prior_precision = prior_variances.mapv(|v| 1.0 / v);

    let mut posterior_precision = xtx.mapv(|v| emission_precision * v);
    posterior_precision
        .diag_mut()
        .zip_mut_with(&prior_precision, |p, &a| *p += a);

    let inverse = posterior_precision
        .inv()
        .map_err(|e| EmError::SingularMatrix(e.to_string()))?;
    if inverse.iter().any(|v| !v.is_finite()) {
        return Err(EmError::SingularMatrix(
            "inverse of the posterior precision has non-finite entries".to_string(),
        ));
    }

    let covariance = (&inverse + &inverse.t()) * 0.5;
    let mean = covariance.dot(&xty) * emission_precision;

    Ok(Posterior { mean, covariance })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use ndarray_linalg::{Cholesky, UPLO};

    #[test]
    fn test_single_weight_matches_conjugate_update() {
        // One weight, prior variance 2, noise variance 0.5, x^T x = 4, x^T y = 3.
        let posterior = obtain_posterior(
            array![[4.0]].view(),
            array![3.0].view(),
            array![2.0].view(),
            0.5,
        )
        .unwrap();

        // Precision = 1/2 + 4/0.5 = 8.5
        assert_abs_diff_eq!(posterior.covariance[[0, 0]], 1.0 / 8.5, epsilon = 1e-14);
        assert_abs_diff_eq!(posterior.mean[0], (3.0 / 0.5) / 8.5, epsilon = 1e-14);
    }

    #[test]
    fn test_covariance_is_symmetric_positive_definite() {
        let x = array![
            [1.0, 0.2, 0.0],
            [0.5, 1.0, 0.3],
            [0.1, 0.4, 1.0],
            [0.9, 0.1, 0.7],
            [0.3, 0.8, 0.2]
        ];
        let y = array![1.0, -0.5, 0.25, 2.0, 0.0];
        let xtx = x.t().dot(&x);
        let xty = x.t().dot(&y);

        for (prior, noise) in [
            (array![1.0, 1.0, 1.0], 1.0),
            (array![1e-6, 10.0, 3.0], 1e-4),
            (array![1e8, 1e-3, 0.5], 25.0),
        ] {
            let posterior = obtain_posterior(xtx.view(), xty.view(), prior.view(), noise).unwrap();
            let cov = &posterior.covariance;
            for i in 0..3 {
                for j in 0..3 {
                    assert_eq!(cov[[i, j]], cov[[j, i]], "covariance must be symmetric");
                }
            }
            assert!(
                cov.cholesky(UPLO::Lower).is_ok(),
                "covariance must be positive definite"
            );
        }
    }

    #[test]
    fn test_mean_solves_normal_equations() {
        let xtx = array![[2.0, 0.5], [0.5, 1.0]];
        let xty = array![1.0, -1.0];
        let prior = array![4.0, 0.25];
        let noise = 0.1;
        let posterior = obtain_posterior(xtx.view(), xty.view(), prior.view(), noise).unwrap();

        // (A + beta X^T X) mean == beta X^T y
        let precision = &xtx / noise + &Array2::from_diag(&prior.mapv(|v| 1.0 / v));
        let lhs = precision.dot(&posterior.mean);
        let rhs = &xty / noise;
        for i in 0..2 {
            assert_abs_diff_eq!(lhs[i], rhs[i], epsilon = 1e-10);
        }
    }

    #[test]
    fn test_singular_precision_is_surfaced() {
        // Perfectly collinear columns with a prior too weak to register
        // next to the data precision: 1e20 + 1e-10 rounds back to 1e20.
        let xtx = array![[1.0, 1.0], [1.0, 1.0]];
        let xty = array![1.0, 1.0];
        let prior = array![1e10, 1e10];
        let result = obtain_posterior(xtx.view(), xty.view(), prior.view(), 1e-20);
        assert!(
            matches!(result, Err(EmError::SingularMatrix(_))),
            "Expected SingularMatrix, got {result:?}"
        );
    }

    #[test]
    fn test_invalid_inputs_are_rejected() {
        let xtx = array![[1.0]];
        let xty = array![1.0];
        assert!(matches!(
            obtain_posterior(xtx.view(), xty.view(), array![1.0].view(), 0.0),
            Err(EmError::InvalidHyperparameter { .. })
        ));
        assert!(matches!(
            obtain_posterior(xtx.view(), xty.view(), array![-1.0].view(), 1.0),
            Err(EmError::InvalidHyperparameter { .. })
        ));
        assert!(matches!(
            obtain_posterior(xtx.view(), xty.view(), array![1.0, 1.0].view(), 1.0),
            Err(EmError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_empty_active_set_yields_empty_posterior() {
        let posterior = obtain_posterior(
            Array2::<f64>::zeros((0, 0)).view(),
            Array1::<f64>::zeros(0).view(),
            Array1::<f64>::zeros(0).view(),
            1.0,
        )
        .unwrap();
        assert!(posterior.mean.is_empty());
        assert_eq!(posterior.covariance.shape(), &[0, 0]);
    }
}
