//! Core public types for the meta-model module.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::input::ScriptResultError;

use super::growth::ModelForm;

/// Errors returned by meta-model configuration, fitting, and prediction.
#[derive(Debug, Error)]
pub enum MetaModelError {
    #[error(transparent)]
    InvalidScriptResult(#[from] ScriptResultError),
    #[error("the result is not compatible with previous results for this stratum group")]
    IncompatibleScriptResult,
    #[error("the output type {0} is not part of the dataset")]
    UnknownOutputType(String),
    #[error("no script result has been added to this meta-model")]
    EmptyScriptResults,
    #[error("unknown model form: {0}")]
    UnknownModelForm(String),
    #[error("the distribution {0} is not supported")]
    UnsupportedDistribution(String),
    #[error("parameter {0} is not included in the parameter map")]
    MissingParameter(String),
    #[error("the distribution of {name} expects {expected} parameters; found {found}")]
    InvalidDistributionParameters {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("starting values could not be parsed: {0}")]
    InvalidParameterConfig(String),
    #[error("invalid Metropolis-Hastings configuration: {0}")]
    InvalidSimulationParameters(&'static str),
    #[error("the sum of squared residuals is negative")]
    NegativeQuadraticForm,
    #[error("no candidate model converged")]
    NoCandidateConverged,
    #[error("no meta-model is registered for stratum group {0}")]
    UnknownStratumGroup(String),
    #[error("the meta-model has not converged or has not been fitted yet")]
    NotFitted,
    #[error("the Metropolis-Hastings sample has been released from this instance")]
    SampleReleased,
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Simulation settings for the Metropolis-Hastings sampler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetropolisHastingsParameters {
    /// Grid-search draws from the priors used to seed the chain (0 disables).
    pub nb_initial_grid: usize,
    /// Leading accepted samples dropped from the kept chain.
    pub nb_burn_in: usize,
    /// Total accepted proposals (including burn-in) required to stop.
    pub nb_accepted_realizations: usize,
    /// Thinning stride over the post-burn-in accepted samples.
    pub one_each: usize,
    /// Proposal standard deviation as a fraction of the current value.
    pub coef_var: f64,
    /// Lower bound of the acceptance-rate convergence window.
    pub acceptance_rate_lower: f64,
    /// Upper bound of the acceptance-rate convergence window.
    pub acceptance_rate_upper: f64,
    /// Hard cap on proposals before the chain gives up.
    pub nb_max_trials: usize,
    /// Base RNG seed; each candidate worker offsets it deterministically.
    pub seed: u64,
}

impl Default for MetropolisHastingsParameters {
    fn default() -> Self {
        Self {
            nb_initial_grid: 10_000,
            nb_burn_in: 10_000,
            nb_accepted_realizations: 510_000,
            one_each: 50,
            coef_var: 0.05,
            acceptance_rate_lower: 0.15,
            acceptance_rate_upper: 0.45,
            nb_max_trials: 10_000_000,
            seed: 42,
        }
    }
}

impl MetropolisHastingsParameters {
    /// # Errors
    ///
    /// Returns `MetaModelError` if the settings are internally inconsistent.
    pub fn validate(&self) -> Result<(), MetaModelError> {
        if self.nb_accepted_realizations == 0 {
            return Err(MetaModelError::InvalidSimulationParameters(
                "nb_accepted_realizations must be positive",
            ));
        }
        if self.nb_burn_in >= self.nb_accepted_realizations {
            return Err(MetaModelError::InvalidSimulationParameters(
                "nb_burn_in must be smaller than nb_accepted_realizations",
            ));
        }
        if self.one_each == 0 {
            return Err(MetaModelError::InvalidSimulationParameters(
                "one_each must be positive",
            ));
        }
        if !(self.coef_var > 0.0) {
            return Err(MetaModelError::InvalidSimulationParameters(
                "coef_var must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&self.acceptance_rate_lower)
            || !(0.0..=1.0).contains(&self.acceptance_rate_upper)
            || self.acceptance_rate_lower >= self.acceptance_rate_upper
        {
            return Err(MetaModelError::InvalidSimulationParameters(
                "acceptance-rate window must satisfy 0 <= lower < upper <= 1",
            ));
        }
        if self.nb_max_trials < self.nb_accepted_realizations {
            return Err(MetaModelError::InvalidSimulationParameters(
                "nb_max_trials must be at least nb_accepted_realizations",
            ));
        }
        Ok(())
    }

    /// Number of thinned samples implied by the schedule.
    #[must_use]
    pub const fn final_sample_size(&self) -> usize {
        (self.nb_accepted_realizations - self.nb_burn_in).div_ceil(self.one_each)
    }
}

/// Variance output requested from [`crate::MetaModel::predictions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PredictionVarianceOutput {
    /// No variance output.
    #[default]
    None,
    /// Variance from the parameter-estimate covariance only.
    ParameterEstimates,
    /// Parameter-estimate variance plus the random-effect contribution.
    ParameterEstimatesWithRandomEffect,
}

/// One row of the prediction table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictionRow {
    pub age_yr: f64,
    pub pred: f64,
    pub variance: Option<f64>,
}

/// One row of the Monte-Carlo prediction table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonteCarloPredictionRow {
    pub realization_id: usize,
    pub subject_id: usize,
    pub age_yr: f64,
    pub pred: f64,
}

/// One row of the model-comparison table produced by the fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelComparisonRow {
    pub model_form: ModelForm,
    /// Log pseudo-marginal likelihood; `None` when the chain did not converge.
    pub lpml: Option<f64>,
    /// Posterior model weight among the converged candidates.
    pub weight: f64,
    pub converged: bool,
}

impl ModelComparisonRow {
    /// LPML as a plain float, `NaN` for non-converged candidates.
    #[must_use]
    pub fn lpml_value(&self) -> f64 {
        self.lpml.unwrap_or(f64::NAN)
    }
}
