//! Simulation-output containers consumed by the meta-model fitting engine.
//!
//! A [`ScriptResult`] holds the stochastic projections of one stratum for a
//! single initial age, as produced by the upstream growth simulator.

use faer::Mat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned when validating simulator output.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScriptResultError {
    #[error("the result data set must contain at least one record")]
    EmptyDataSet,
    #[error("records mix variance estimator kinds: {first} and {other}")]
    MixedVarianceEstimators { first: String, other: String },
    #[error("the number of plots must be positive")]
    InvalidPlotCount,
    #[error("the number of realizations must be positive")]
    InvalidRealizationCount,
}

/// One observation row of a simulator projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptResultRecord {
    /// Calendar year of the observation.
    pub date_yr: i32,
    /// Elapsed years since the start of the simulation.
    pub time_since_initial_date_yr: i32,
    /// Name of the observed quantity (e.g. `AliveVolume_AllSpecies`).
    pub output_type: String,
    /// Point estimate of the quantity.
    pub estimate: f64,
    /// Estimator variance, when the simulator provides one.
    pub variance: Option<f64>,
    /// Label of the variance estimator used by the simulator.
    pub variance_estimator_type: String,
}

/// The projection of one stratum from a given initial age.
///
/// Result sets for different initial ages can only be pooled into one
/// meta-model when [`ScriptResult::is_compatible`] holds between them.
///
/// # Examples
///
/// ```
/// use stand_metamodels::{ScriptResult, ScriptResultRecord};
///
/// let record = ScriptResultRecord {
///     date_yr: 2000,
///     time_since_initial_date_yr: 0,
///     output_type: "AliveVolume_AllSpecies".to_string(),
///     estimate: 25.2,
///     variance: Some(1.0),
///     variance_estimator_type: "LeaveOneOut".to_string(),
/// };
/// let result = ScriptResult::new(500, 20, "NoChange".to_string(), "Artemis".to_string(), vec![record]);
///
/// assert!(result.validate().is_ok());
/// assert_eq!(result.output_types(), vec!["AliveVolume_AllSpecies"]);
/// assert!(result.is_variance_available());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptResult {
    nb_realizations: usize,
    nb_plots: usize,
    climate_change_scenario: String,
    growth_model: String,
    dataset: Vec<ScriptResultRecord>,
}

impl ScriptResult {
    #[must_use]
    pub const fn new(
        nb_realizations: usize,
        nb_plots: usize,
        climate_change_scenario: String,
        growth_model: String,
        dataset: Vec<ScriptResultRecord>,
    ) -> Self {
        Self {
            nb_realizations,
            nb_plots,
            climate_change_scenario,
            growth_model,
            dataset,
        }
    }

    /// # Errors
    ///
    /// Returns `ScriptResultError` if the record table is empty, mixes
    /// variance-estimator kinds, or carries non-positive counts.
    pub fn validate(&self) -> Result<(), ScriptResultError> {
        if self.dataset.is_empty() {
            return Err(ScriptResultError::EmptyDataSet);
        }
        if self.nb_plots == 0 {
            return Err(ScriptResultError::InvalidPlotCount);
        }
        if self.nb_realizations == 0 {
            return Err(ScriptResultError::InvalidRealizationCount);
        }
        let first = &self.dataset[0].variance_estimator_type;
        for record in &self.dataset[1..] {
            if record.variance_estimator_type != *first {
                return Err(ScriptResultError::MixedVarianceEstimators {
                    first: first.clone(),
                    other: record.variance_estimator_type.clone(),
                });
            }
        }
        Ok(())
    }

    /// Unique output types, in first-appearance order.
    #[must_use]
    pub fn output_types(&self) -> Vec<String> {
        let mut types: Vec<String> = Vec::new();
        for record in &self.dataset {
            if !types.contains(&record.output_type) {
                types.push(record.output_type.clone());
            }
        }
        types
    }

    #[must_use]
    pub fn dataset(&self) -> &[ScriptResultRecord] {
        &self.dataset
    }

    #[must_use]
    pub const fn nb_plots(&self) -> usize {
        self.nb_plots
    }

    #[must_use]
    pub const fn nb_realizations(&self) -> usize {
        self.nb_realizations
    }

    #[must_use]
    pub fn climate_change_scenario(&self) -> &str {
        &self.climate_change_scenario
    }

    #[must_use]
    pub fn growth_model(&self) -> &str {
        &self.growth_model
    }

    /// Variance-estimator label shared by all records, when any.
    #[must_use]
    pub fn variance_estimator_type(&self) -> Option<&str> {
        self.dataset
            .first()
            .map(|record| record.variance_estimator_type.as_str())
    }

    /// Whether every record carries an estimator variance.
    #[must_use]
    pub fn is_variance_available(&self) -> bool {
        !self.dataset.is_empty() && self.dataset.iter().all(|record| record.variance.is_some())
    }

    /// Whether two result sets come from the same simulation origin.
    ///
    /// Pooling requires the same simulator, realization count, and climate
    /// scenario.
    #[must_use]
    pub fn is_compatible(&self, other: &Self) -> bool {
        self.growth_model == other.growth_model
            && self.nb_realizations == other.nb_realizations
            && self.climate_change_scenario == other.climate_change_scenario
    }

    /// Residual error-term covariance for one output type.
    ///
    /// Returns the diagonal covariance built from the per-record estimator
    /// variances, or `None` if at least one selected record has no variance.
    #[must_use]
    pub fn compute_var_cov_error_term(&self, output_type: &str) -> Option<Mat<f64>> {
        let variances: Vec<f64> = self
            .dataset
            .iter()
            .filter(|record| record.output_type == output_type)
            .map(|record| record.variance)
            .collect::<Option<Vec<f64>>>()?;
        if variances.is_empty() {
            return None;
        }
        Some(Mat::from_fn(variances.len(), variances.len(), |i, j| {
            if i == j { variances[i] } else { 0.0 }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(output_type: &str, estimate: f64, variance: Option<f64>) -> ScriptResultRecord {
        ScriptResultRecord {
            date_yr: 2000,
            time_since_initial_date_yr: 0,
            output_type: output_type.to_string(),
            estimate,
            variance,
            variance_estimator_type: "LeaveOneOut".to_string(),
        }
    }

    fn result(records: Vec<ScriptResultRecord>) -> ScriptResult {
        ScriptResult::new(
            500,
            20,
            "NoChange".to_string(),
            "Artemis".to_string(),
            records,
        )
    }

    #[test]
    fn output_types_preserve_first_appearance_order() {
        let sr = result(vec![
            record("AliveVolume_AllSpecies", 25.2, Some(1.0)),
            record("AliveVolume_ConiferousSpecies", 12.1, Some(0.5)),
            record("AliveVolume_AllSpecies", 32.0, Some(1.2)),
        ]);
        assert_eq!(
            sr.output_types(),
            vec!["AliveVolume_AllSpecies", "AliveVolume_ConiferousSpecies"]
        );
    }

    #[test]
    fn compatibility_requires_same_simulation_origin() {
        let a = result(vec![record("AliveVolume_AllSpecies", 25.2, None)]);
        let b = result(vec![record("AliveVolume_AllSpecies", 15.2, None)]);
        assert!(a.is_compatible(&b));

        let c = ScriptResult::new(
            500,
            20,
            "RCP4_5".to_string(),
            "Artemis".to_string(),
            vec![record("AliveVolume_AllSpecies", 15.2, None)],
        );
        assert!(!a.is_compatible(&c));
    }

    #[test]
    fn variance_availability_requires_every_record() {
        let complete = result(vec![
            record("AliveVolume_AllSpecies", 25.2, Some(1.0)),
            record("AliveVolume_AllSpecies", 32.0, Some(1.2)),
        ]);
        assert!(complete.is_variance_available());

        let partial = result(vec![
            record("AliveVolume_AllSpecies", 25.2, Some(1.0)),
            record("AliveVolume_AllSpecies", 32.0, None),
        ]);
        assert!(!partial.is_variance_available());
    }

    #[test]
    fn var_cov_error_term_is_diagonal_over_selected_rows() {
        let sr = result(vec![
            record("AliveVolume_AllSpecies", 25.2, Some(1.0)),
            record("AliveVolume_ConiferousSpecies", 12.1, Some(9.0)),
            record("AliveVolume_AllSpecies", 32.0, Some(4.0)),
        ]);
        let var_cov = sr
            .compute_var_cov_error_term("AliveVolume_AllSpecies")
            .expect("variance should be available");
        assert_eq!(var_cov.nrows(), 2);
        assert!((var_cov[(0, 0)] - 1.0).abs() < 1.0e-12);
        assert!((var_cov[(1, 1)] - 4.0).abs() < 1.0e-12);
        assert!((var_cov[(0, 1)]).abs() < 1.0e-12);
    }

    #[test]
    fn validate_rejects_mixed_variance_estimators() {
        let mut mixed = result(vec![record("AliveVolume_AllSpecies", 25.2, Some(1.0))]);
        mixed.dataset.push(ScriptResultRecord {
            variance_estimator_type: "Bootstrap".to_string(),
            ..record("AliveVolume_AllSpecies", 30.0, Some(1.0))
        });
        assert!(matches!(
            mixed.validate(),
            Err(ScriptResultError::MixedVarianceEstimators { .. })
        ));
    }
}
