//! M-step, part one: automatic relevance determination and pruning.
//!
//! For each active basis function the ARD statistics are
//!
//! * `alpha = 1 / prior_variance` (current precision),
//! * `gamma = 1 - alpha * posterior_covariance[m, m]`, the share of the weight
//!   that is determined by the data rather than the prior,
//! * `alpha_new = gamma / posterior_mean[m]^2`.
//!
//! A basis function whose re-estimated precision exceeds the pruning threshold
//! is clamped to the threshold, contributes `gamma = 0`, and is removed from the
//! active set. Removal is permanent: the design matrix, posterior mean,
//! precisions, mask and original-index map are all shrunk together.
//!
//! Without pruning, an irrelevant weight's precision keeps growing until
//! `gamma` is no longer resolvable in floating point. From then on its
//! precision is held where it is and it contributes `gamma = 0`. Every
//! re-estimate is capped at `PRECISION_CEILING` so the prior variances handed
//! to the next E-step stay finite and positive.

use crate::estimate::EmError;
use crate::matrix::{ensure_len, select_columns, select_entries};
use crate::posterior::Posterior;
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

/// Precision above which a weight is considered indistinguishable from zero.
pub const DEFAULT_PRUNING_THRESHOLD: f64 = 1e10;

/// Largest precision a re-estimate may take.
pub const PRECISION_CEILING: f64 = 1e100;

/// Controls when basis functions are dropped from the active set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PruningPolicy {
    pub threshold: f64,
}

impl PruningPolicy {
    /// ARD pruning at the given precision threshold.
    pub fn with_threshold(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Fixed-dimension EM: nothing is ever pruned.
    pub fn disabled() -> Self {
        Self {
            threshold: f64::INFINITY,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.threshold.is_finite()
    }
}

impl Default for PruningPolicy {
    fn default() -> Self {
        Self::with_threshold(DEFAULT_PRUNING_THRESHOLD)
    }
}

/// Everything the sparsity step hands back to the controller.
///
/// `alpha`, `mask`, `design` columns, `posterior_mean` and `active_indices` are
/// index-aligned and cover only the surviving basis functions.
#[derive(Debug, Clone)]
pub struct SparsityUpdate {
    /// Number of observations (rows of the design).
    pub n: usize,
    /// Effective number of well-determined parameters, after clamping.
    pub sum_gamma: f64,
    /// Re-estimated precisions of the surviving basis functions.
    pub alpha: Array1<f64>,
    pub mask: Array1<bool>,
    pub design: Array2<f64>,
    pub posterior_mean: Array1<f64>,
    /// Original column index of each surviving basis function.
    pub active_indices: Vec<usize>,
    /// Original column indices removed by this step.
    pub pruned: Vec<usize>,
}

/// Runs the ARD re-estimate of every active precision and drops the basis
/// functions whose precision diverges.
///
/// A posterior mean of exactly zero has no finite precision estimate. With
/// pruning enabled such a weight is pruned outright; with pruning disabled it is
/// reported as `DivergentPrecision`. A non-positive `gamma` is pruned when
/// pruning is enabled and otherwise keeps its current precision with
/// `gamma = 0`.
pub fn prune_basis_functions(
    design: Array2<f64>,
    mask: Array1<bool>,
    active_indices: Vec<usize>,
    prior_variances: ArrayView1<f64>,
    posterior: &Posterior,
    policy: PruningPolicy,
) -> Result<SparsityUpdate, EmError> {
    let m_active = design.ncols();
    ensure_len("active mask length", m_active, mask.len())?;
    ensure_len(
        "active mask count",
        m_active,
        mask.iter().filter(|&&keep| keep).count(),
    )?;
    ensure_len("active index map", m_active, active_indices.len())?;
    ensure_len("prior variances", m_active, prior_variances.len())?;
    ensure_len("posterior mean", m_active, posterior.mean.len())?;
    ensure_len("posterior covariance", m_active, posterior.covariance.nrows())?;

    let mut mask = mask;
    let mut alpha_new = Array1::<f64>::zeros(m_active);
    let mut sum_gamma = 0.0;

    for m in 0..m_active {
        let alpha = 1.0 / prior_variances[m];
        let mut gamma = 1.0 - alpha * posterior.covariance[[m, m]];
        let mean = posterior.mean[m];

        let candidate = if mean == 0.0 {
            if !policy.is_enabled() {
                return Err(EmError::DivergentPrecision {
                    index: active_indices[m],
                    gamma,
                    mean,
                });
            }
            f64::INFINITY
        } else if gamma <= 0.0 {
            if policy.is_enabled() {
                f64::INFINITY
            } else {
                gamma = 0.0;
                alpha.min(PRECISION_CEILING)
            }
        } else {
            // mean^2 may underflow to zero; the ceiling absorbs the infinity.
            (gamma / (mean * mean)).min(PRECISION_CEILING)
        };

        if candidate > policy.threshold {
            alpha_new[m] = policy.threshold;
            gamma = 0.0;
            mask[m] = false;
        } else {
            if gamma > 1.0 {
                log::warn!(
                    "Basis function {} has gamma {:.6} outside [0, 1]",
                    active_indices[m],
                    gamma
                );
            }
            alpha_new[m] = candidate;
        }

        sum_gamma += gamma;
    }

    let n = design.nrows();
    let pruned: Vec<usize> = active_indices
        .iter()
        .zip(mask.iter())
        .filter_map(|(&idx, &keep)| (!keep).then_some(idx))
        .collect();

    if pruned.is_empty() {
        return Ok(SparsityUpdate {
            n,
            sum_gamma,
            alpha: alpha_new,
            mask,
            design,
            posterior_mean: posterior.mean.clone(),
            active_indices,
            pruned,
        });
    }

    let design = select_columns(design.view(), mask.view())?;
    let posterior_mean = select_entries(posterior.mean.view(), mask.view())?;
    let alpha = select_entries(alpha_new.view(), mask.view())?;
    let active_indices: Vec<usize> = active_indices
        .into_iter()
        .zip(mask.iter())
        .filter_map(|(idx, &keep)| keep.then_some(idx))
        .collect();
    let mask = Array1::from_elem(design.ncols(), true);

    ensure_len("shrunk posterior mean", design.ncols(), posterior_mean.len())?;
    ensure_len("shrunk precisions", design.ncols(), alpha.len())?;
    ensure_len("shrunk index map", design.ncols(), active_indices.len())?;

    Ok(SparsityUpdate {
        n,
        sum_gamma,
        alpha,
        mask,
        design,
        posterior_mean,
        active_indices,
        pruned,
    })
}
