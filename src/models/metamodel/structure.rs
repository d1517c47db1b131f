//! Hierarchical observation structure joining per-age simulator output.
//!
//! Rows of every result set are filtered to one output type, stamped with a
//! synthetic `initial_age_yr` column, and concatenated into a single
//! observation vector grouped by `(initial age, output type)` blocks.

use std::collections::BTreeMap;

use faer::Mat;
use serde::{Deserialize, Serialize};

use crate::input::ScriptResult;
use crate::models::matrix_ops::matrix_diag_block;

use super::types::MetaModelError;

/// One observation of the assembled data set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub initial_age_yr: u32,
    pub date_yr: i32,
    pub time_since_initial_date_yr: i32,
    pub output_type: String,
    pub estimate: f64,
}

impl Observation {
    /// Stratum age at the time of observation.
    #[must_use]
    pub fn stratum_age_yr(&self) -> f64 {
        f64::from(self.initial_age_yr) + f64::from(self.time_since_initial_date_yr)
    }
}

/// A contiguous group of rows sharing `(initial age, output type)`.
#[derive(Debug, Clone)]
pub(crate) struct DataBlock {
    pub block_id: String,
    pub initial_age_yr: u32,
    pub indices: Vec<usize>,
    pub nb_plots: usize,
}

/// The assembled observation vector with its block index lists.
#[derive(Debug, Clone)]
pub(crate) struct HierarchicalDataStructure {
    pub observations: Vec<Observation>,
    pub blocks: Vec<DataBlock>,
    pub minimum_stratum_age_yr: u32,
    /// Block-diagonal residual covariance, when every result set provides
    /// estimator variances. Rows not selected for the output type contribute
    /// no rows here.
    pub overall_var_cov: Option<Mat<f64>>,
}

impl HierarchicalDataStructure {
    /// Assemble the structure for one output type.
    ///
    /// # Errors
    ///
    /// Returns `UnknownOutputType` if no result set carries the requested
    /// output type, and `EmptyScriptResults` when the map is empty.
    pub(crate) fn assemble(
        output_type: &str,
        script_results: &BTreeMap<u32, ScriptResult>,
        variance_available: bool,
    ) -> Result<Self, MetaModelError> {
        if script_results.is_empty() {
            return Err(MetaModelError::EmptyScriptResults);
        }
        let known = script_results
            .values()
            .any(|result| result.output_types().iter().any(|name| name == output_type));
        if !known {
            return Err(MetaModelError::UnknownOutputType(output_type.to_string()));
        }

        let mut observations = Vec::new();
        let mut blocks = Vec::new();
        let mut minimum_stratum_age_yr = u32::MAX;
        for (&initial_age_yr, result) in script_results {
            let first_row = observations.len();
            for record in result.dataset() {
                if record.output_type == output_type {
                    observations.push(Observation {
                        initial_age_yr,
                        date_yr: record.date_yr,
                        time_since_initial_date_yr: record.time_since_initial_date_yr,
                        output_type: record.output_type.clone(),
                        estimate: record.estimate,
                    });
                }
            }
            if observations.len() == first_row {
                continue;
            }
            blocks.push(DataBlock {
                block_id: format!("{initial_age_yr}_{output_type}"),
                initial_age_yr,
                indices: (first_row..observations.len()).collect(),
                nb_plots: result.nb_plots(),
            });
            minimum_stratum_age_yr = minimum_stratum_age_yr.min(initial_age_yr);
        }

        let overall_var_cov = if variance_available {
            let mut var_cov: Option<Mat<f64>> = None;
            for (&initial_age_yr, result) in script_results {
                if !blocks
                    .iter()
                    .any(|block| block.initial_age_yr == initial_age_yr)
                {
                    continue;
                }
                let block_var_cov = result
                    .compute_var_cov_error_term(output_type)
                    .ok_or_else(|| MetaModelError::UnknownOutputType(output_type.to_string()))?;
                var_cov = Some(match var_cov {
                    None => block_var_cov,
                    Some(existing) => matrix_diag_block(&existing, &block_var_cov),
                });
            }
            var_cov
        } else {
            None
        };

        Ok(Self {
            observations,
            blocks,
            minimum_stratum_age_yr,
            overall_var_cov,
        })
    }

    /// Whether the fit should estimate a regeneration lag.
    pub(crate) const fn is_regeneration_lag_needed(&self) -> bool {
        self.minimum_stratum_age_yr <= super::growth::REG_LAG_AGE_YR_LIMIT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::ScriptResultRecord;

    fn record(
        output_type: &str,
        time_since: i32,
        estimate: f64,
        variance: Option<f64>,
    ) -> ScriptResultRecord {
        ScriptResultRecord {
            date_yr: 2000 + time_since,
            time_since_initial_date_yr: time_since,
            output_type: output_type.to_string(),
            estimate,
            variance,
            variance_estimator_type: "LeaveOneOut".to_string(),
        }
    }

    fn two_age_results() -> BTreeMap<u32, ScriptResult> {
        let mut results = BTreeMap::new();
        results.insert(
            30,
            ScriptResult::new(
                500,
                20,
                "NoChange".to_string(),
                "Artemis".to_string(),
                vec![
                    record("AliveVolume_AllSpecies", 0, 25.2, Some(1.0)),
                    record("AliveVolume_ConiferousSpecies", 0, 12.0, Some(0.4)),
                    record("AliveVolume_AllSpecies", 10, 32.0, Some(1.5)),
                ],
            ),
        );
        results.insert(
            50,
            ScriptResult::new(
                500,
                25,
                "NoChange".to_string(),
                "Artemis".to_string(),
                vec![
                    record("AliveVolume_AllSpecies", 0, 55.0, Some(2.0)),
                    record("AliveVolume_AllSpecies", 10, 61.0, Some(2.5)),
                ],
            ),
        );
        results
    }

    #[test]
    fn assemble_groups_rows_into_per_age_blocks() {
        let structure =
            HierarchicalDataStructure::assemble("AliveVolume_AllSpecies", &two_age_results(), true)
                .expect("assembly should succeed");
        assert_eq!(structure.observations.len(), 4);
        assert_eq!(structure.blocks.len(), 2);
        assert_eq!(structure.blocks[0].indices, vec![0, 1]);
        assert_eq!(structure.blocks[1].indices, vec![2, 3]);
        assert_eq!(structure.blocks[0].nb_plots, 20);
        assert_eq!(structure.blocks[1].nb_plots, 25);
        assert_eq!(structure.minimum_stratum_age_yr, 30);
        assert!(!structure.is_regeneration_lag_needed());
    }

    #[test]
    fn unselected_rows_contribute_no_covariance_rows() {
        let structure =
            HierarchicalDataStructure::assemble("AliveVolume_AllSpecies", &two_age_results(), true)
                .expect("assembly should succeed");
        let var_cov = structure.overall_var_cov.expect("variance is available");
        assert_eq!(var_cov.nrows(), 4);
        assert!((var_cov[(0, 0)] - 1.0).abs() < 1.0e-12);
        assert!((var_cov[(1, 1)] - 1.5).abs() < 1.0e-12);
        assert!((var_cov[(2, 2)] - 2.0).abs() < 1.0e-12);
        assert!((var_cov[(2, 3)]).abs() < 1.0e-12);
    }

    #[test]
    fn unknown_output_type_is_rejected() {
        let error = HierarchicalDataStructure::assemble("StemDensity", &two_age_results(), false)
            .expect_err("unknown output type should fail");
        assert!(matches!(error, MetaModelError::UnknownOutputType(name) if name == "StemDensity"));
    }

    #[test]
    fn young_stratum_enables_the_regeneration_lag() {
        let mut results = two_age_results();
        results.insert(
            5,
            ScriptResult::new(
                500,
                20,
                "NoChange".to_string(),
                "Artemis".to_string(),
                vec![record("AliveVolume_AllSpecies", 0, 0.5, Some(0.1))],
            ),
        );
        let structure =
            HierarchicalDataStructure::assemble("AliveVolume_AllSpecies", &results, false)
                .expect("assembly should succeed");
        assert_eq!(structure.minimum_stratum_age_yr, 5);
        assert!(structure.is_regeneration_lag_needed());
    }

    #[test]
    fn stratum_age_adds_initial_age_and_elapsed_time() {
        let structure =
            HierarchicalDataStructure::assemble("AliveVolume_AllSpecies", &two_age_results(), false)
                .expect("assembly should succeed");
        assert!((structure.observations[1].stratum_age_yr() - 40.0).abs() < 1.0e-12);
    }
}
