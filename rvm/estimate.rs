// rvm/estimate.rs

//! # Sparse Bayesian Regression via Expectation-Maximization
//!
//! This module owns the evolving state of a Relevance Vector Machine fit and
//! drives it through a fixed number of EM iterations. Each iteration:
//!
//! 1.  **E-step:** Recomputes `X^T X` and `X^T y` from the *current* design
//!     (columns may have been dropped by the previous iteration) and solves for
//!     the Gaussian posterior over the active weights.
//!
//! 2.  **M-step, sparsity:** Re-estimates each weight's ARD precision and prunes
//!     the basis functions whose precision diverges, shrinking the design matrix,
//!     posterior mean, precisions and active mask together.
//!
//! 3.  **M-step, hyperparameters:** Re-estimates the emission variance from the
//!     residuals and turns the surviving precisions into the prior variances
//!     used by the next E-step.
//!
//! The controller makes no convergence decision of its own: exactly
//! `num_iterations` rounds run, after which it is `Converged`. Fixed-dimension
//! EM is the same loop with pruning disabled.

use crate::matrix::{
    ensure_len, gram_statistics, mask_indices, select_columns, select_entries, strict_diagonal,
};
use crate::posterior::obtain_posterior;
use crate::reestimate::reestimate_hyperparameters;
use crate::sparsity::{PruningPolicy, prune_basis_functions};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use thiserror::Error;

/// A comprehensive error type for the EM inference engine.
///
/// None of these are recovered from locally: the first error aborts the run and
/// no partial result is returned.
#[derive(Error, Debug)]
pub enum EmError {
    #[error("The posterior precision matrix is singular and cannot be inverted: {0}")]
    SingularMatrix(String),

    #[error(
        "Effective residual degrees of freedom are not positive (N = {n}, sum of gamma = {sum_gamma:.6}); the fit is saturated."
    )]
    DegenerateDenominator { n: usize, sum_gamma: f64 },

    #[error("Dimension mismatch in {context}: expected {expected}, found {found}.")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Invalid value {value} for {name}: {constraint}.")]
    InvalidHyperparameter {
        name: String,
        value: f64,
        constraint: &'static str,
    },

    #[error(
        "Basis function {index} has no finite precision estimate (posterior mean {mean:.3e}, gamma {gamma:.3e}) and pruning is disabled."
    )]
    DivergentPrecision { index: usize, gamma: f64, mean: f64 },

    #[error("The EM controller has already completed all {iterations} iterations.")]
    AlreadyConverged { iterations: usize },
}

pub(crate) fn ensure_positive(name: &str, value: f64) -> Result<(), EmError> {
    if !(value.is_finite() && value > 0.0) {
        return Err(EmError::InvalidHyperparameter {
            name: name.to_string(),
            value,
            constraint: "must be finite and strictly positive",
        });
    }
    Ok(())
}

/// Run-level settings for the EM loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmConfig {
    pub num_iterations: usize,
    pub pruning: PruningPolicy,
}

impl EmConfig {
    /// ARD-pruning EM at the default threshold.
    pub fn new(num_iterations: usize) -> Self {
        Self {
            num_iterations,
            pruning: PruningPolicy::default(),
        }
    }

    pub fn with_pruning(mut self, pruning: PruningPolicy) -> Self {
        self.pruning = pruning;
        self
    }
}

/// Lifecycle of an `EmController`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmPhase {
    Initialized,
    Iterating { completed: usize },
    /// The iteration budget is exhausted. Terminal.
    Converged,
}

/// What happened during one EM iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationSummary {
    /// 1-based iteration number.
    pub iteration: usize,
    pub active_before: usize,
    pub active_after: usize,
    /// Original column indices pruned in this iteration.
    pub pruned: Vec<usize>,
    pub sum_gamma: f64,
    /// Emission variance handed to the next iteration.
    pub emission_variance: f64,
}

/// Result of a completed EM run.
#[derive(Debug, Clone)]
pub struct EmOutput {
    pub posterior_mean: Array1<f64>,
    /// The final, possibly shrunk, design matrix.
    pub design: Array2<f64>,
    /// Original column index of each surviving basis function.
    pub active_indices: Vec<usize>,
    pub prior_variances: Array1<f64>,
    pub emission_variance: f64,
    pub history: Vec<IterationSummary>,
}

impl EmOutput {
    /// Fitted values `design * posterior_mean`.
    pub fn fitted_values(&self) -> Array1<f64> {
        self.design.dot(&self.posterior_mean)
    }

    /// Surviving basis functions as a mask over the caller's original columns.
    pub fn active_mask(&self, num_basis: usize) -> Result<Array1<bool>, EmError> {
        if let Some(&max_idx) = self.active_indices.iter().max() {
            if max_idx >= num_basis {
                return Err(EmError::DimensionMismatch {
                    context: "basis functions covering the active indices",
                    expected: max_idx + 1,
                    found: num_basis,
                });
            }
        }
        let mut mask = Array1::from_elem(num_basis, false);
        for &idx in &self.active_indices {
            mask[idx] = true;
        }
        Ok(mask)
    }
}

/// Owns the active set, hyperparameters and posterior mean across iterations.
///
/// State is threaded by value: `step` consumes the controller and returns the
/// next one, so a failed iteration leaves nothing half-updated behind.
#[derive(Debug, Clone)]
pub struct EmController {
    config: EmConfig,
    observations: Array1<f64>,
    design: Array2<f64>,
    mask: Array1<bool>,
    active_indices: Vec<usize>,
    prior_variances: Array1<f64>,
    emission_variance: f64,
    posterior_mean: Array1<f64>,
    phase: EmPhase,
    history: Vec<IterationSummary>,
}

impl EmController {
    /// Validates the caller's inputs and sets up the initial active set.
    ///
    /// `initial_mask`, `prior_mean` and `prior_covariance` are indexed by the
    /// columns of `design`. Columns whose mask entry is `false` are dropped
    /// before the first iteration, so the active mask and the design agree from
    /// the first iteration boundary onwards.
    pub fn new(
        config: EmConfig,
        initial_mask: ArrayView1<bool>,
        observations: ArrayView1<f64>,
        design: ArrayView2<f64>,
        prior_mean: ArrayView1<f64>,
        prior_covariance: ArrayView2<f64>,
        emission_variance: f64,
    ) -> Result<Self, EmError> {
        if config.num_iterations == 0 {
            return Err(EmError::InvalidHyperparameter {
                name: "num_iterations".to_string(),
                value: 0.0,
                constraint: "at least one EM iteration is required",
            });
        }

        let num_basis = design.ncols();
        ensure_len("initial mask vs design columns", num_basis, initial_mask.len())?;
        ensure_len("observations vs design rows", design.nrows(), observations.len())?;
        ensure_len("prior mean vs design columns", num_basis, prior_mean.len())?;
        ensure_len(
            "prior covariance vs design columns",
            num_basis,
            prior_covariance.nrows(),
        )?;

        if let Some((idx, &value)) = prior_mean.indexed_iter().find(|&(_, &v)| v != 0.0) {
            return Err(EmError::InvalidHyperparameter {
                name: format!("prior_mean[{idx}]"),
                value,
                constraint: "the ARD prior must be zero-mean",
            });
        }

        let prior_variances = strict_diagonal(prior_covariance)?;
        for (idx, &variance) in prior_variances.indexed_iter() {
            ensure_positive(&format!("prior_variance[{idx}]"), variance)?;
        }
        ensure_positive("emission_variance", emission_variance)?;

        let active_indices = mask_indices(initial_mask);
        let design = select_columns(design, initial_mask)?;
        let prior_variances = select_entries(prior_variances.view(), initial_mask)?;
        let mask = Array1::from_elem(active_indices.len(), true);

        log::info!(
            "Initialized EM with {} observations, {} of {} basis functions active, {} iterations.",
            observations.len(),
            active_indices.len(),
            num_basis,
            config.num_iterations
        );
        if config.pruning.is_enabled() {
            log::info!("ARD pruning threshold: {:.3e}", config.pruning.threshold);
        } else {
            log::info!("Pruning disabled; running fixed-dimension EM.");
        }

        Ok(Self {
            config,
            observations: observations.to_owned(),
            posterior_mean: Array1::zeros(design.ncols()),
            design,
            mask,
            active_indices,
            prior_variances,
            emission_variance,
            phase: EmPhase::Initialized,
            history: Vec::with_capacity(config.num_iterations),
        })
    }

    pub fn phase(&self) -> EmPhase {
        self.phase
    }

    pub fn history(&self) -> &[IterationSummary] {
        &self.history
    }

    pub fn active_indices(&self) -> &[usize] {
        &self.active_indices
    }

    pub fn design(&self) -> ArrayView2<'_, f64> {
        self.design.view()
    }

    /// Current posterior mean; the (zero) prior mean before the first iteration.
    pub fn posterior_mean(&self) -> ArrayView1<'_, f64> {
        self.posterior_mean.view()
    }

    pub fn prior_variances(&self) -> ArrayView1<'_, f64> {
        self.prior_variances.view()
    }

    pub fn emission_variance(&self) -> f64 {
        self.emission_variance
    }

    /// Runs one E-step and M-step and commits the shrunk state.
    pub fn step(mut self) -> Result<Self, EmError> {
        let iteration = match self.phase {
            EmPhase::Initialized => 1,
            EmPhase::Iterating { completed } => completed + 1,
            EmPhase::Converged => {
                return Err(EmError::AlreadyConverged {
                    iterations: self.config.num_iterations,
                });
            }
        };
        let active_before = self.design.ncols();

        // The Gram statistics follow the design as it shrinks.
        let stats = gram_statistics(self.design.view(), self.observations.view())?;
        let posterior = obtain_posterior(
            stats.xtx.view(),
            stats.xty.view(),
            self.prior_variances.view(),
            self.emission_variance,
        )?;

        let update = prune_basis_functions(
            self.design,
            self.mask,
            self.active_indices,
            self.prior_variances.view(),
            &posterior,
            self.config.pruning,
        )?;

        let hyperparameters = reestimate_hyperparameters(
            self.observations.view(),
            update.design.view(),
            update.sum_gamma,
            update.alpha.view(),
            update.posterior_mean.view(),
        )?;

        let summary = IterationSummary {
            iteration,
            active_before,
            active_after: update.design.ncols(),
            pruned: update.pruned,
            sum_gamma: update.sum_gamma,
            emission_variance: hyperparameters.emission_variance,
        };

        if !summary.pruned.is_empty() {
            log::info!(
                "EM iteration {}: pruned basis functions {:?}; {} remain active.",
                iteration,
                summary.pruned,
                summary.active_after
            );
        }
        log::debug!(
            "EM iteration {}/{}: {} active, sum_gamma = {:.4}, emission variance = {:.6e}",
            iteration,
            self.config.num_iterations,
            summary.active_after,
            summary.sum_gamma,
            summary.emission_variance
        );

        self.design = update.design;
        self.mask = update.mask;
        self.active_indices = update.active_indices;
        self.posterior_mean = update.posterior_mean;
        self.prior_variances = hyperparameters.prior_variances;
        self.emission_variance = hyperparameters.emission_variance;
        self.history.push(summary);
        self.phase = if iteration >= self.config.num_iterations {
            EmPhase::Converged
        } else {
            EmPhase::Iterating {
                completed: iteration,
            }
        };

        Ok(self)
    }

    /// Runs every remaining iteration and returns the final fit.
    pub fn run(self) -> Result<EmOutput, EmError> {
        let mut controller = self;
        while controller.phase != EmPhase::Converged {
            controller = controller.step()?;
        }

        log::info!(
            "EM finished after {} iterations: {} basis functions active {:?}, emission variance {:.6e}",
            controller.history.len(),
            controller.active_indices.len(),
            controller.active_indices,
            controller.emission_variance
        );

        Ok(EmOutput {
            posterior_mean: controller.posterior_mean,
            design: controller.design,
            active_indices: controller.active_indices,
            prior_variances: controller.prior_variances,
            emission_variance: controller.emission_variance,
            history: controller.history,
        })
    }
}

/// The main entry point for inference: ARD-pruning EM at the default threshold.
///
/// Runs exactly `num_iterations` EM rounds and returns the final posterior mean
/// together with the final design matrix; fitted values are
/// `output.design.dot(&output.posterior_mean)`.
pub fn run_em_algorithm(
    num_iterations: usize,
    initial_mask: ArrayView1<bool>,
    observations: ArrayView1<f64>,
    design: ArrayView2<f64>,
    prior_mean: ArrayView1<f64>,
    prior_covariance: ArrayView2<f64>,
    emission_variance: f64,
) -> Result<EmOutput, EmError> {
    EmController::new(
        EmConfig::new(num_iterations),
        initial_mask,
        observations,
        design,
        prior_mean,
        prior_covariance,
        emission_variance,
    )?
    .run()
}
