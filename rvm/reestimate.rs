//! M-step, part two: hyperparameters for the next E-step.

use crate::estimate::EmError;
use crate::matrix::ensure_len;
use ndarray::{Array1, ArrayView1, ArrayView2};

/// Prior variances and emission variance carried into the next iteration.
#[derive(Debug, Clone)]
pub struct Hyperparameters {
    /// Diagonal of the prior covariance, `1 / alpha` per surviving weight.
    pub prior_variances: Array1<f64>,
    pub emission_variance: f64,
}

/// Re-estimates the emission variance from the residuals of the current fit and
/// converts the ARD precisions back into prior variances.
///
/// `emission_variance = |y - X mean|^2 / (N - sum_gamma)`, where the
/// denominator is the effective residual degrees of freedom. It must be
/// strictly positive, otherwise `DegenerateDenominator` is returned.
pub fn reestimate_hyperparameters(
    y: ArrayView1<f64>,
    design: ArrayView2<f64>,
    sum_gamma: f64,
    alpha: ArrayView1<f64>,
    posterior_mean: ArrayView1<f64>,
) -> Result<Hyperparameters, EmError> {
    let n = design.nrows();
    ensure_len("observations vs design rows", n, y.len())?;
    ensure_len("posterior mean vs design columns", design.ncols(), posterior_mean.len())?;
    ensure_len("precisions vs design columns", design.ncols(), alpha.len())?;

    let residual = &y - &design.dot(&posterior_mean);
    let residual_sq = residual.dot(&residual);

    let denominator = n as f64 - sum_gamma;
    if denominator.is_nan() || denominator <= 0.0 {
        return Err(EmError::DegenerateDenominator { n, sum_gamma });
    }

    Ok(Hyperparameters {
        prior_variances: alpha.mapv(|a| 1.0 / a),
        emission_variance: residual_sq / denominator,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    #[test]
    fn test_variance_uses_effective_degrees_of_freedom() {
        let design = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0], [0.0, 0.0]];
        let mean = array![2.0, -1.0];
        let y = array![2.5, -1.0, 0.0, 1.0];
        // Residuals: 0.5, 0.0, -1.0, 1.0 -> squared sum 2.25
        let result =
            reestimate_hyperparameters(y.view(), design.view(), 1.5, array![4.0, 0.5].view(), mean.view())
                .unwrap();

        assert_abs_diff_eq!(result.emission_variance, 2.25 / 2.5, epsilon = 1e-14);
        assert_eq!(result.prior_variances, array![0.25, 2.0]);
    }

    #[test]
    fn test_saturated_fit_is_degenerate() {
        let design = Array2::<f64>::eye(3);
        let y = array![1.0, 2.0, 3.0];
        let mean = array![1.0, 2.0, 3.0];
        let alpha = array![1.0, 1.0, 1.0];

        for sum_gamma in [3.0, 3.5] {
            match reestimate_hyperparameters(y.view(), design.view(), sum_gamma, alpha.view(), mean.view())
                .unwrap_err()
            {
                EmError::DegenerateDenominator { n, sum_gamma: found } => {
                    assert_eq!(n, 3);
                    assert_eq!(found, sum_gamma);
                }
                other => panic!("Expected DegenerateDenominator, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_empty_active_set_uses_raw_observations() {
        let design = Array2::<f64>::zeros((4, 0));
        let y = array![1.0, -1.0, 1.0, -1.0];
        let result = reestimate_hyperparameters(
            y.view(),
            design.view(),
            0.0,
            Array1::<f64>::zeros(0).view(),
            Array1::<f64>::zeros(0).view(),
        )
        .unwrap();
        assert_abs_diff_eq!(result.emission_variance, 1.0, epsilon = 1e-14);
        assert!(result.prior_variances.is_empty());
    }

    #[test]
    fn test_misaligned_mean_is_rejected() {
        let design = Array2::<f64>::eye(2);
        let result = reestimate_hyperparameters(
            array![1.0, 1.0].view(),
            design.view(),
            0.5,
            array![1.0, 1.0].view(),
            array![1.0].view(),
        );
        assert!(matches!(result, Err(EmError::DimensionMismatch { .. })));
    }
}
