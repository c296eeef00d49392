use crate::basis::{BasisError, generate_basis_functions, season_layout};
use crate::estimate::{EmConfig, EmOutput};
use crate::sparsity::{DEFAULT_PRUNING_THRESHOLD, PruningPolicy};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML file: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Failed to serialize to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error("Underlying basis function generation failed: {0}")]
    BasisError(#[from] BasisError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "Fitted model is inconsistent: {indices} surviving basis indices, {means} posterior means, {variances} prior variances, {num_basis} basis functions in the calendar."
    )]
    Inconsistent {
        indices: usize,
        means: usize,
        variances: usize,
        num_basis: usize,
    },
}

/// The daily calendar the seasonal basis is laid out on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    pub num_years: usize,
    pub days_per_year: usize,
    pub seasons_per_year: usize,
    pub include_bias: bool,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            num_years: 2,
            days_per_year: 365,
            seasons_per_year: 4,
            include_bias: true,
        }
    }
}

impl CalendarConfig {
    /// One observation per day.
    pub fn num_time_steps(&self) -> Result<usize, ModelError> {
        self.num_years
            .checked_mul(self.days_per_year)
            .ok_or_else(|| {
                ModelError::InvalidConfig(format!(
                    "{} years of {} days overflow the number of time steps",
                    self.num_years, self.days_per_year
                ))
            })
    }

    pub fn num_basis(&self) -> usize {
        self.seasons_per_year + usize::from(self.include_bias)
    }

    pub fn design(&self, num_time_steps: usize) -> Result<Array2<f64>, BasisError> {
        generate_basis_functions(
            num_time_steps,
            self.seasons_per_year,
            self.days_per_year,
            self.include_bias,
        )
    }
}

/// How the synthetic ground truth is drawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub emission_variance: f64,
    pub probability_of_omission: f64,
    pub seed: u64,
    /// Fixes the generating mask instead of drawing it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<Vec<bool>>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            emission_variance: 1e-4,
            probability_of_omission: 0.25,
            seed: 42,
            mask: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub num_iterations: usize,
    /// The EM run starts from `initial_variance_factor * emission_variance`.
    pub initial_variance_factor: f64,
    /// Shared starting precision of every weight's ARD prior.
    pub initial_prior_precision: f64,
    pub pruning_threshold: f64,
    pub pruning: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            num_iterations: 10,
            initial_variance_factor: 1.2,
            initial_prior_precision: 1.0,
            pruning_threshold: DEFAULT_PRUNING_THRESHOLD,
            pruning: true,
        }
    }
}

/// Everything a single end-to-end run needs. Missing sections or keys in a
/// TOML file fall back to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub calendar: CalendarConfig,
    pub synthetic: SyntheticConfig,
    pub inference: InferenceConfig,
}

impl RunConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Checks the values no lower layer would catch with a clear message.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.calendar.num_years == 0 {
            return Err(ModelError::InvalidConfig(
                "calendar.num_years must be at least 1".to_string(),
            ));
        }
        self.calendar.num_time_steps()?;
        season_layout(self.calendar.seasons_per_year, self.calendar.days_per_year)?;
        if let Some(mask) = &self.synthetic.mask {
            if mask.len() != self.calendar.num_basis() {
                return Err(ModelError::InvalidConfig(format!(
                    "synthetic.mask has {} entries but the calendar has {} basis functions",
                    mask.len(),
                    self.calendar.num_basis()
                )));
            }
        }
        if !(self.inference.initial_variance_factor.is_finite()
            && self.inference.initial_variance_factor > 0.0)
        {
            return Err(ModelError::InvalidConfig(format!(
                "inference.initial_variance_factor must be positive, got {}",
                self.inference.initial_variance_factor
            )));
        }
        if !(self.inference.initial_prior_precision.is_finite()
            && self.inference.initial_prior_precision > 0.0)
        {
            return Err(ModelError::InvalidConfig(format!(
                "inference.initial_prior_precision must be positive, got {}",
                self.inference.initial_prior_precision
            )));
        }
        if self.inference.pruning && !(self.inference.pruning_threshold > 0.0) {
            return Err(ModelError::InvalidConfig(format!(
                "inference.pruning_threshold must be positive, got {}",
                self.inference.pruning_threshold
            )));
        }
        Ok(())
    }

    pub fn pruning_policy(&self) -> PruningPolicy {
        if self.inference.pruning {
            PruningPolicy::with_threshold(self.inference.pruning_threshold)
        } else {
            PruningPolicy::disabled()
        }
    }

    pub fn em_config(&self) -> EmConfig {
        EmConfig::new(self.inference.num_iterations).with_pruning(self.pruning_policy())
    }

    /// Starting emission variance handed to the EM run.
    pub fn initial_emission_variance(&self) -> f64 {
        self.inference.initial_variance_factor * self.synthetic.emission_variance
    }
}

/// The surviving basis functions and their posterior, enough to predict on any
/// horizon of the same calendar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    /// Column of the full seasonal basis behind each posterior mean entry.
    pub active_indices: Vec<usize>,
    pub posterior_mean: Vec<f64>,
    pub prior_variances: Vec<f64>,
    pub emission_variance: f64,
    pub calendar: CalendarConfig,
}

impl FittedModel {
    pub fn from_output(calendar: CalendarConfig, output: &EmOutput) -> Self {
        Self {
            calendar,
            active_indices: output.active_indices.clone(),
            posterior_mean: output.posterior_mean.to_vec(),
            prior_variances: output.prior_variances.to_vec(),
            emission_variance: output.emission_variance,
        }
    }

    /// Posterior mean prediction for the first `num_time_steps` days.
    pub fn predict(&self, num_time_steps: usize) -> Result<Array1<f64>, ModelError> {
        let full_design = self.calendar.design(num_time_steps)?;
        let num_basis = full_design.ncols();
        if self.active_indices.len() != self.posterior_mean.len()
            || self.prior_variances.len() != self.posterior_mean.len()
            || self.active_indices.iter().any(|&idx| idx >= num_basis)
        {
            return Err(ModelError::Inconsistent {
                indices: self.active_indices.len(),
                means: self.posterior_mean.len(),
                variances: self.prior_variances.len(),
                num_basis,
            });
        }

        let design = full_design.select(Axis(1), &self.active_indices);
        Ok(design.dot(&Array1::from(self.posterior_mean.clone())))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model = toml::from_str(&toml_string)?;
        Ok(model)
    }
}
