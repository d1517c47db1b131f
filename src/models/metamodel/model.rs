//! One candidate model: a growth form wired to its parameter layout,
//! priors, and data blocks.
//!
//! The sampler owns a `CandidateModel` mutably for the duration of a chain;
//! blocks cache their covariance for the current parameter vector and the
//! vector is always passed explicitly.

use std::collections::BTreeMap;

use faer::Mat;

use crate::input::ScriptResult;
use crate::utils::column_from_slice;

use super::blocks::DataBlockWrapper;
use super::growth::{
    CORRELATION_PARM, ModelForm, RANDOM_EFFECT_STD, REG_LAG_AGE_YR_LIMIT, REG_LAG_PARM,
    RESIDUAL_VARIANCE,
};
use super::parameters::{FormattedParameter, ParameterRecord, format_parameters_map};
use super::priors::{PriorHandler, UniformPrior};
use super::structure::{HierarchicalDataStructure, Observation};
use super::types::MetaModelError;

/// Ordered layout of one candidate's parameter vector.
///
/// Scalar parameters come first (fixed effects, then `rho`, `sigma_u`,
/// `sigma2_res`, `regLag` as applicable); mixed models append one
/// random-effect slot per block after all scalars, so slicing the fixed
/// effects always uses a fixed prefix.
#[derive(Debug, Clone)]
pub(crate) struct ParameterLayout {
    pub names: Vec<String>,
    pub n_fixed_effects: usize,
    pub rho_index: usize,
    pub sigma_u_index: Option<usize>,
    pub residual_variance_index: Option<usize>,
    pub reg_lag_index: Option<usize>,
    pub n_random_effects: usize,
}

impl ParameterLayout {
    pub(crate) fn new(
        form: ModelForm,
        variance_available: bool,
        reg_lag_needed: bool,
        nb_blocks: usize,
    ) -> Self {
        let mut names: Vec<String> = form
            .effect_list()
            .iter()
            .map(|name| (*name).to_string())
            .collect();
        let n_fixed_effects = names.len();
        let rho_index = names.len();
        names.push(CORRELATION_PARM.to_string());
        let sigma_u_index = form.has_random_effect().then(|| {
            names.push(RANDOM_EFFECT_STD.to_string());
            names.len() - 1
        });
        let residual_variance_index = (!variance_available).then(|| {
            names.push(RESIDUAL_VARIANCE.to_string());
            names.len() - 1
        });
        let reg_lag_index = reg_lag_needed.then(|| {
            names.push(REG_LAG_PARM.to_string());
            names.len() - 1
        });
        Self {
            names,
            n_fixed_effects,
            rho_index,
            sigma_u_index,
            residual_variance_index,
            reg_lag_index,
            n_random_effects: if form.has_random_effect() { nb_blocks } else { 0 },
        }
    }

    pub(crate) fn n_scalar(&self) -> usize {
        self.names.len()
    }

    pub(crate) fn total_length(&self) -> usize {
        self.names.len() + self.n_random_effects
    }

    /// Scalar names followed by one `u_<initial age>` label per block.
    pub(crate) fn full_names(&self, blocks: &[DataBlockWrapper]) -> Vec<String> {
        let mut names = self.names.clone();
        if self.n_random_effects > 0 {
            for block in blocks {
                names.push(format!("u_{}", block.initial_age_yr));
            }
        }
        names
    }
}

/// Regeneration-lag aware prediction.
///
/// The effective age is `age_yr - reg_lag_yr`; a non-positive effective age
/// returns 0 before the growth formula is evaluated.
pub(crate) fn predict_with_lag(
    form: ModelForm,
    age_yr: f64,
    time_since_beginning: f64,
    random_effect: f64,
    parms: &Mat<f64>,
    reg_lag_yr: f64,
) -> f64 {
    let effective_age_yr = age_yr - reg_lag_yr;
    if effective_age_yr <= 0.0 {
        return 0.0;
    }
    form.predict(effective_age_yr, time_since_beginning, random_effect, parms)
}

/// Fixed-effects gradient at the effective age, zero when the effective age
/// is non-positive.
pub(crate) fn gradient_with_lag(
    form: ModelForm,
    age_yr: f64,
    time_since_beginning: f64,
    parms: &Mat<f64>,
    reg_lag_yr: f64,
) -> Mat<f64> {
    let effective_age_yr = age_yr - reg_lag_yr;
    if effective_age_yr <= 0.0 {
        return Mat::zeros(form.effect_list().len(), 1);
    }
    form.gradient(effective_age_yr, time_since_beginning, 0.0, parms)
}

pub(crate) struct CandidateModel {
    pub form: ModelForm,
    pub output_type: String,
    pub stratum_group: String,
    pub blocks: Vec<DataBlockWrapper>,
    pub layout: ParameterLayout,
    pub priors: PriorHandler,
    pub variance_available: bool,
    pub observations: Vec<Observation>,
    parameters_map: BTreeMap<String, FormattedParameter>,
}

impl CandidateModel {
    pub(crate) fn new(
        form: ModelForm,
        output_type: &str,
        stratum_group: &str,
        script_results: &BTreeMap<u32, ScriptResult>,
        estimate_residual_variance: bool,
        starting_values: Option<Vec<ParameterRecord>>,
    ) -> Result<Self, MetaModelError> {
        let variance_available = !estimate_residual_variance
            && !script_results.is_empty()
            && script_results
                .values()
                .all(ScriptResult::is_variance_available);
        let structure =
            HierarchicalDataStructure::assemble(output_type, script_results, variance_available)?;
        let blocks: Vec<DataBlockWrapper> = structure
            .blocks
            .iter()
            .map(|block| {
                DataBlockWrapper::new(
                    block,
                    &structure.observations,
                    structure.overall_var_cov.as_ref(),
                )
            })
            .collect();
        let layout = ParameterLayout::new(
            form,
            variance_available,
            structure.is_regeneration_lag_needed(),
            blocks.len(),
        );

        let records = starting_values.unwrap_or_else(|| form.default_parameters());
        let parameters_map =
            format_parameters_map(&records, &layout.names, &[REG_LAG_PARM])?;

        let mut priors = PriorHandler::default();
        for (index, name) in layout.names.iter().enumerate() {
            let prior = if name == REG_LAG_PARM {
                UniformPrior::new(0.0, f64::from(REG_LAG_AGE_YR_LIMIT))
            } else {
                parameters_map[name].prior
            };
            priors.add_fixed_effect(index, prior);
        }
        if let Some(sigma_u_index) = layout.sigma_u_index {
            for i in 0..blocks.len() {
                priors.add_random_effect(layout.n_scalar() + i, sigma_u_index);
            }
        }

        Ok(Self {
            form,
            output_type: output_type.to_string(),
            stratum_group: stratum_group.to_string(),
            blocks,
            layout,
            priors,
            variance_available,
            observations: structure.observations,
            parameters_map,
        })
    }

    /// Starting parameter vector: mapped starting values, a zero lag, and
    /// zero random-effect deviations.
    pub(crate) fn starting_values(&self) -> Mat<f64> {
        let mut values = vec![0.0; self.layout.total_length()];
        for (index, name) in self.layout.names.iter().enumerate() {
            values[index] = if name == REG_LAG_PARM {
                0.0
            } else {
                self.parameters_map[name].starting_value
            };
        }
        column_from_slice(&values)
    }

    /// Diagonal proposal variance for the sampler.
    ///
    /// Scalar entries use `(value * coef_var)^2` with the regeneration lag
    /// anchored at its upper bound; random-effect slots use `sigma_u`
    /// because raw deviations have no natural scale.
    pub(crate) fn sampler_variance(&self, parms: &Mat<f64>, coef_var: f64) -> Vec<f64> {
        let n_scalar = self.layout.n_scalar();
        (0..self.layout.total_length())
            .map(|i| {
                let value = if Some(i) == self.layout.reg_lag_index {
                    f64::from(REG_LAG_AGE_YR_LIMIT)
                } else if i < n_scalar {
                    parms[(i, 0)]
                } else {
                    let sigma_u_index = self
                        .layout
                        .sigma_u_index
                        .expect("random-effect slots imply sigma_u");
                    parms[(sigma_u_index, 0)]
                };
                (value * coef_var).powi(2)
            })
            .collect()
    }

    fn reg_lag_yr(&self, parms: &Mat<f64>) -> f64 {
        self.layout
            .reg_lag_index
            .map_or(0.0, |index| parms[(index, 0)])
    }

    fn block_random_effect(&self, parms: &Mat<f64>, block_index: usize) -> f64 {
        if self.layout.n_random_effects > 0 {
            parms[(self.layout.n_scalar() + block_index, 0)]
        } else {
            0.0
        }
    }

    /// Refresh every block covariance for the given parameter vector.
    pub(crate) fn update_covariances(&mut self, parms: &Mat<f64>) {
        let rho = parms[(self.layout.rho_index, 0)];
        let residual_variance = self
            .layout
            .residual_variance_index
            .map(|index| parms[(index, 0)]);
        for block in &mut self.blocks {
            block.update_cov_mat(rho, residual_variance);
        }
    }

    /// Marginal log-likelihood over all blocks.
    ///
    /// # Errors
    ///
    /// Returns `NegativeQuadraticForm` when a block quadratic form breaks
    /// down; the sampler treats this as fatal for the chain.
    pub(crate) fn log_likelihood(&mut self, parms: &Mat<f64>) -> Result<f64, MetaModelError> {
        self.update_covariances(parms);
        let mut total = 0.0;
        for block_index in 0..self.blocks.len() {
            total += self.block_log_likelihood(parms, block_index)?;
        }
        Ok(total)
    }

    /// Log-likelihood of one block under the current covariances.
    pub(crate) fn block_log_likelihood(
        &self,
        parms: &Mat<f64>,
        block_index: usize,
    ) -> Result<f64, MetaModelError> {
        let block = &self.blocks[block_index];
        let random_effect = self.block_random_effect(parms, block_index);
        // The lag shifts the curve origin only for cohorts young enough to
        // be affected by it.
        let reg_lag_yr = if block.initial_age_yr <= REG_LAG_AGE_YR_LIMIT {
            self.reg_lag_yr(parms)
        } else {
            0.0
        };
        let predictions = Mat::from_fn(block.size(), 1, |i, _| {
            predict_with_lag(
                self.form,
                block.age_yr[i],
                block.time_since_beginning[i],
                random_effect,
                parms,
                reg_lag_yr,
            )
        });
        block.log_likelihood(&predictions)
    }

    /// Point prediction with the regeneration lag applied.
    pub(crate) fn predict(
        &self,
        parms: &Mat<f64>,
        age_yr: f64,
        time_since_beginning: f64,
        random_effect: f64,
    ) -> f64 {
        predict_with_lag(
            self.form,
            age_yr,
            time_since_beginning,
            random_effect,
            parms,
            self.reg_lag_yr(parms),
        )
    }

    pub(crate) fn log_message_prefix(&self) -> String {
        format!("{} implementation {}", self.stratum_group, self.form)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::ScriptResultRecord;
    use approx::assert_relative_eq;

    fn record(time_since: i32, estimate: f64, variance: Option<f64>) -> ScriptResultRecord {
        ScriptResultRecord {
            date_yr: 2000 + time_since,
            time_since_initial_date_yr: time_since,
            output_type: "AliveVolume_AllSpecies".to_string(),
            estimate,
            variance,
            variance_estimator_type: "LeaveOneOut".to_string(),
        }
    }

    fn chapman_richards_estimate(age: f64) -> f64 {
        100.0 * (1.0 - (-0.02 * age).exp()).powf(2.0)
    }

    fn script_results(initial_ages: &[u32], with_variance: bool) -> BTreeMap<u32, ScriptResult> {
        let mut results = BTreeMap::new();
        for &initial_age in initial_ages {
            let records = (0..5)
                .map(|step| {
                    let time_since = step * 10;
                    let age = f64::from(initial_age) + f64::from(time_since);
                    record(
                        time_since,
                        chapman_richards_estimate(age),
                        with_variance.then_some(4.0),
                    )
                })
                .collect();
            results.insert(
                initial_age,
                ScriptResult::new(
                    500,
                    20,
                    "NoChange".to_string(),
                    "Artemis".to_string(),
                    records,
                ),
            );
        }
        results
    }

    #[test]
    fn layout_orders_scalars_then_random_effects() {
        let results = script_results(&[5, 30, 50], false);
        let model = CandidateModel::new(
            ModelForm::ChapmanRichardsWithRandomEffect,
            "AliveVolume_AllSpecies",
            "RE2",
            &results,
            false,
            None,
        )
        .expect("construction should succeed");

        assert_eq!(
            model.layout.names,
            vec!["b1", "b2", "b3", "rho", "sigma_u", "sigma2_res", "regLag"]
        );
        assert_eq!(model.layout.n_fixed_effects, 3);
        assert_eq!(model.layout.rho_index, 3);
        assert_eq!(model.layout.sigma_u_index, Some(4));
        assert_eq!(model.layout.residual_variance_index, Some(5));
        assert_eq!(model.layout.reg_lag_index, Some(6));
        assert_eq!(model.layout.n_random_effects, 3);
        assert_eq!(model.layout.total_length(), 10);
        let full_names = model.layout.full_names(&model.blocks);
        assert_eq!(full_names[7], "u_5");
        assert_eq!(full_names[9], "u_50");
    }

    #[test]
    fn regeneration_lag_is_absent_for_old_strata() {
        let results = script_results(&[30, 50], true);
        let model = CandidateModel::new(
            ModelForm::ChapmanRichards,
            "AliveVolume_AllSpecies",
            "RE2",
            &results,
            false,
            None,
        )
        .expect("construction should succeed");
        assert_eq!(model.layout.names, vec!["b1", "b2", "b3", "rho"]);
        assert!(model.layout.reg_lag_index.is_none());
        assert!(model.layout.residual_variance_index.is_none());
    }

    #[test]
    fn starting_values_use_map_and_zero_lag() {
        let results = script_results(&[5, 30], false);
        let model = CandidateModel::new(
            ModelForm::ChapmanRichards,
            "AliveVolume_AllSpecies",
            "RE2",
            &results,
            false,
            None,
        )
        .expect("construction should succeed");
        let start = model.starting_values();
        assert_relative_eq!(start[(0, 0)], 100.0);
        assert_relative_eq!(start[(1, 0)], 0.02);
        assert_relative_eq!(start[(3, 0)], 0.92);
        let reg_lag_index = model.layout.reg_lag_index.expect("lag is active");
        assert_relative_eq!(start[(reg_lag_index, 0)], 0.0);
    }

    #[test]
    fn sampler_variance_follows_the_parameter_scale() {
        let results = script_results(&[5, 30], false);
        let model = CandidateModel::new(
            ModelForm::ChapmanRichardsWithRandomEffect,
            "AliveVolume_AllSpecies",
            "RE2",
            &results,
            false,
            None,
        )
        .expect("construction should succeed");
        let start = model.starting_values();
        let variance = model.sampler_variance(&start, 0.1);
        // fixed effect: (100 * 0.1)^2
        assert_relative_eq!(variance[0], 100.0);
        // regeneration lag: anchored at the age limit, (10 * 0.1)^2
        let reg_lag_index = model.layout.reg_lag_index.expect("lag is active");
        assert_relative_eq!(variance[reg_lag_index], 1.0);
        // random-effect slots: (sigma_u * 0.1)^2 with sigma_u = 15
        let sigma_u_index = model.layout.sigma_u_index.expect("mixed model");
        let expected = (start[(sigma_u_index, 0)] * 0.1).powi(2);
        assert_relative_eq!(variance[model.layout.n_scalar()], expected);
        assert_relative_eq!(variance[model.layout.n_scalar() + 1], expected);
    }

    #[test]
    fn log_likelihood_is_finite_at_the_starting_values() {
        let results = script_results(&[30, 50], true);
        let mut model = CandidateModel::new(
            ModelForm::ChapmanRichards,
            "AliveVolume_AllSpecies",
            "RE2",
            &results,
            false,
            None,
        )
        .expect("construction should succeed");
        let start = model.starting_values();
        let ll = model
            .log_likelihood(&start)
            .expect("well-behaved starting point");
        assert!(ll.is_finite());
    }

    #[test]
    fn missing_lag_matches_explicit_zero_lag() {
        let results = script_results(&[30, 50], true);
        let model = CandidateModel::new(
            ModelForm::ChapmanRichards,
            "AliveVolume_AllSpecies",
            "RE2",
            &results,
            false,
            None,
        )
        .expect("construction should succeed");
        let parms = model.starting_values();
        let with_api = model.predict(&parms, 90.0, 0.0, 0.0);
        let direct = predict_with_lag(ModelForm::ChapmanRichards, 90.0, 0.0, 0.0, &parms, 0.0);
        assert_relative_eq!(with_api, direct);
        assert_relative_eq!(with_api, 69.67259460041194, epsilon = 1.0e-10);
    }

    #[test]
    fn prediction_below_the_lag_is_zero() {
        let parms = Mat::from_fn(4, 1, |i, _| [100.0, 0.02, 2.0, 0.92][i]);
        let pred = predict_with_lag(ModelForm::ChapmanRichards, 8.0, 0.0, 0.0, &parms, 8.87);
        assert_relative_eq!(pred, 0.0);
        let gradient = gradient_with_lag(ModelForm::ChapmanRichards, 8.0, 0.0, &parms, 8.87);
        for i in 0..3 {
            assert_relative_eq!(gradient[(i, 0)], 0.0);
        }
    }

    #[test]
    fn estimate_residual_variance_overrides_available_variance() {
        let results = script_results(&[30], true);
        let model = CandidateModel::new(
            ModelForm::ChapmanRichards,
            "AliveVolume_AllSpecies",
            "RE2",
            &results,
            true,
            None,
        )
        .expect("construction should succeed");
        assert!(!model.variance_available);
        assert!(model.layout.residual_variance_index.is_some());
    }
}
