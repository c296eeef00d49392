//! Small linear-algebra helpers shared by the E-step and M-step.
//!
//! Everything here operates on dense `ndarray` storage. General inversion lives
//! in `posterior.rs` where it is backed by `ndarray-linalg`; these helpers only
//! cover the cheap bookkeeping around it: Gram statistics, diagonal handling and
//! mask-driven column selection.

use crate::estimate::EmError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// The `X^T X` and `X^T y` products of the current design matrix.
///
/// These must be recomputed whenever columns are dropped from the design, so
/// they are never cached across EM iterations.
#[derive(Debug, Clone)]
pub struct GramStatistics {
    pub xtx: Array2<f64>,
    pub xty: Array1<f64>,
}

pub fn gram_statistics(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
) -> Result<GramStatistics, EmError> {
    ensure_len("observations vs design rows", x.nrows(), y.len())?;
    let xt = x.t();
    Ok(GramStatistics {
        xtx: xt.dot(&x),
        xty: xt.dot(&y),
    })
}

/// Returns an error unless `found == expected`.
pub fn ensure_len(context: &'static str, expected: usize, found: usize) -> Result<(), EmError> {
    if expected != found {
        return Err(EmError::DimensionMismatch {
            context,
            expected,
            found,
        });
    }
    Ok(())
}

/// Extracts the diagonal of a matrix that is required to be strictly diagonal.
///
/// Any non-zero off-diagonal entry is rejected rather than silently ignored.
pub fn strict_diagonal(matrix: ArrayView2<f64>) -> Result<Array1<f64>, EmError> {
    ensure_len("square matrix columns", matrix.nrows(), matrix.ncols())?;
    if let Some(((row, col), &value)) = matrix
        .indexed_iter()
        .find(|&((row, col), &value)| row != col && value != 0.0)
    {
        return Err(EmError::InvalidHyperparameter {
            name: format!("prior_covariance[{row}, {col}]"),
            value,
            constraint: "off-diagonal prior covariance entries must be zero",
        });
    }
    Ok(matrix.diag().to_owned())
}

/// Builds a dense diagonal matrix from its diagonal.
pub fn diag_matrix(diagonal: ArrayView1<f64>) -> Array2<f64> {
    Array2::from_diag(&diagonal)
}

/// Positions of the `true` entries of a mask, in order.
pub fn mask_indices(mask: ArrayView1<bool>) -> Vec<usize> {
    mask.iter()
        .enumerate()
        .filter_map(|(idx, &keep)| keep.then_some(idx))
        .collect()
}

/// Keeps only the columns of `x` whose mask entry is `true`.
pub fn select_columns(x: ArrayView2<f64>, mask: ArrayView1<bool>) -> Result<Array2<f64>, EmError> {
    ensure_len("mask vs design columns", x.ncols(), mask.len())?;
    Ok(x.select(Axis(1), &mask_indices(mask)))
}

/// Keeps only the entries of `v` whose mask entry is `true`.
pub fn select_entries(v: ArrayView1<f64>, mask: ArrayView1<bool>) -> Result<Array1<f64>, EmError> {
    ensure_len("mask vs vector length", v.len(), mask.len())?;
    Ok(v.select(Axis(0), &mask_indices(mask)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_gram_statistics_match_manual_products() {
        let x = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let y = array![1.0, 0.0, -1.0];
        let stats = gram_statistics(x.view(), y.view()).unwrap();
        assert_eq!(stats.xtx, array![[35.0, 44.0], [44.0, 56.0]]);
        assert_eq!(stats.xty, array![-4.0, -4.0]);
    }

    #[test]
    fn test_gram_statistics_reject_short_observations() {
        let x = Array2::<f64>::zeros((4, 2));
        let y = Array1::<f64>::zeros(3);
        match gram_statistics(x.view(), y.view()).unwrap_err() {
            EmError::DimensionMismatch {
                expected, found, ..
            } => {
                assert_eq!(expected, 4);
                assert_eq!(found, 3);
            }
            other => panic!("Expected DimensionMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_strict_diagonal_rejects_off_diagonal_mass() {
        let good = diag_matrix(array![1.0, 2.0, 3.0].view());
        assert_eq!(strict_diagonal(good.view()).unwrap(), array![1.0, 2.0, 3.0]);

        let mut bad = good.clone();
        bad[[0, 2]] = 1e-3;
        assert!(matches!(
            strict_diagonal(bad.view()),
            Err(EmError::InvalidHyperparameter { .. })
        ));

        let rectangular = Array2::<f64>::zeros((2, 3));
        assert!(matches!(
            strict_diagonal(rectangular.view()),
            Err(EmError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_column_and_entry_selection_stay_aligned() {
        let x = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let v = array![10.0, 20.0, 30.0];
        let mask = array![true, false, true];

        let cols = select_columns(x.view(), mask.view()).unwrap();
        let entries = select_entries(v.view(), mask.view()).unwrap();
        assert_eq!(cols, array![[1.0, 3.0], [4.0, 6.0]]);
        assert_eq!(entries, array![10.0, 30.0]);
        assert_eq!(mask_indices(mask.view()), vec![0, 2]);
    }
}
