//! The meta-model façade for one stratum group.
//!
//! A `MetaModel` accumulates compatible [`ScriptResult`] instances, fits the
//! candidate growth forms in parallel, keeps the winner selected by LPML,
//! and exposes the prediction surface. After a successful fit the state is
//! read-only, so predictions can be served from any thread.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use faer::Mat;
use log::{info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::input::ScriptResult;
use crate::utils::{cholesky_factor, column_entries, column_from_slice, draw_standard_normal};

use super::diagnostics::{ParameterChainDiagnostics, chain_diagnostics};
use super::growth::ModelForm;
use super::model::{CandidateModel, gradient_with_lag, predict_with_lag};
use super::parameters::ParameterConfig;
use super::sampler::{MetropolisHastingsEstimate, run_estimation};
use super::structure::Observation;
use super::summary::render_summary;
use super::types::{
    MetaModelError, MetropolisHastingsParameters, ModelComparisonRow, MonteCarloPredictionRow,
    PredictionRow, PredictionVarianceOutput,
};

/// Seed offset between candidate workers, so each chain is deterministic.
const WORKER_SEED_STRIDE: u64 = 10_000;

/// Read-only state of a converged fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FittedMetaModel {
    pub form: ModelForm,
    pub output_type: String,
    pub parameter_names: Vec<String>,
    pub n_fixed_effects: usize,
    pub sigma_u_index: Option<usize>,
    pub reg_lag_index: Option<usize>,
    pub final_parameter_estimates: Vec<f64>,
    pub parameter_covariance: Vec<Vec<f64>>,
    pub log_pseudomarginal_likelihood: f64,
    pub acceptance_rate: f64,
    /// Thinned Metropolis-Hastings sample; `None` in the light form.
    pub final_sample: Option<Vec<Vec<f64>>>,
    pub observations: Vec<Observation>,
}

impl FittedMetaModel {
    pub(crate) fn parameters(&self) -> Mat<f64> {
        column_from_slice(&self.final_parameter_estimates)
    }

    pub(crate) fn reg_lag_yr(&self) -> f64 {
        self.reg_lag_index
            .map_or(0.0, |index| self.final_parameter_estimates[index])
    }

    fn sigma_u(&self) -> f64 {
        self.sigma_u_index
            .map_or(0.0, |index| self.final_parameter_estimates[index])
    }

    fn fixed_effect_mean(&self) -> Mat<f64> {
        Mat::from_fn(self.n_fixed_effects, 1, |row, _| {
            self.final_parameter_estimates[row]
        })
    }

    /// Covariance submatrix over the fixed-effects prefix.
    fn fixed_effect_covariance(&self) -> Mat<f64> {
        Mat::from_fn(self.n_fixed_effects, self.n_fixed_effects, |i, j| {
            self.parameter_covariance[i][j]
        })
    }

    fn predict(&self, age_yr: f64, time_since_beginning: f64, random_effect: f64) -> f64 {
        predict_with_lag(
            self.form,
            age_yr,
            time_since_beginning,
            random_effect,
            &self.parameters(),
            self.reg_lag_yr(),
        )
    }

    fn prediction_variance(
        &self,
        age_yr: f64,
        time_since_beginning: f64,
        include_random_effect: bool,
    ) -> f64 {
        let gradient = gradient_with_lag(
            self.form,
            age_yr,
            time_since_beginning,
            &self.parameters(),
            self.reg_lag_yr(),
        );
        let covariance = self.fixed_effect_covariance();
        let mut variance = 0.0;
        for i in 0..self.n_fixed_effects {
            for j in 0..self.n_fixed_effects {
                variance += gradient[(i, 0)] * covariance[(i, j)] * gradient[(j, 0)];
            }
        }
        if include_random_effect {
            // the random effect enters through the asymptote coefficient only
            let sigma_u = self.sigma_u();
            variance += gradient[(0, 0)] * gradient[(0, 0)] * sigma_u * sigma_u;
        }
        variance
    }

    pub(crate) fn release_final_sample(&mut self) {
        self.final_sample = None;
    }
}

/// A meta-model of one output type for a group of strata.
#[derive(Debug, Serialize, Deserialize)]
pub struct MetaModel {
    stratum_group: String,
    geo_domain: String,
    data_source: String,
    script_results: BTreeMap<u32, ScriptResult>,
    pub mh_parameters: MetropolisHastingsParameters,
    estimate_residual_variance: bool,
    last_fit_time_stamp: Option<String>,
    fitted: Option<FittedMetaModel>,
    model_comparison: Option<Vec<ModelComparisonRow>>,
}

impl MetaModel {
    #[must_use]
    pub fn new(stratum_group: &str, geo_domain: &str, data_source: &str) -> Self {
        Self {
            stratum_group: stratum_group.to_string(),
            geo_domain: geo_domain.to_string(),
            data_source: data_source.to_string(),
            script_results: BTreeMap::new(),
            mh_parameters: MetropolisHastingsParameters::default(),
            estimate_residual_variance: false,
            last_fit_time_stamp: None,
            fitted: None,
            model_comparison: None,
        }
    }

    #[must_use]
    pub fn stratum_group(&self) -> &str {
        &self.stratum_group
    }

    #[must_use]
    pub fn geo_domain(&self) -> &str {
        &self.geo_domain
    }

    #[must_use]
    pub fn data_source(&self) -> &str {
        &self.data_source
    }

    /// The model can be used for predictions once it has converged.
    #[must_use]
    pub const fn has_converged(&self) -> bool {
        self.fitted.is_some()
    }

    /// Force the residual variance to be estimated even when the simulator
    /// provides estimator variances.
    pub fn set_estimate_residual_variance(&mut self, enabled: bool) {
        self.estimate_residual_variance = enabled;
    }

    /// Timestamp of the last successful fit, as provided by the caller.
    pub fn set_last_fit_time_stamp(&mut self, time_stamp: Option<String>) {
        self.last_fit_time_stamp = time_stamp;
    }

    #[must_use]
    pub fn last_fit_time_stamp(&self) -> Option<&str> {
        self.last_fit_time_stamp.as_deref()
    }

    #[must_use]
    pub(crate) const fn script_results(&self) -> &BTreeMap<u32, ScriptResult> {
        &self.script_results
    }

    /// Add the projection for one initial age.
    ///
    /// Adding to an empty meta-model always succeeds; later additions must
    /// be compatible with the result sets already present.
    ///
    /// # Errors
    ///
    /// Returns `IncompatibleScriptResult` when the simulation origins differ,
    /// or a validation error when the result itself is malformed.
    pub fn add_script_result(
        &mut self,
        initial_age_yr: u32,
        result: ScriptResult,
    ) -> Result<(), MetaModelError> {
        result.validate()?;
        if let Some(previous) = self.script_results.values().next()
            && !previous.is_compatible(&result)
        {
            return Err(MetaModelError::IncompatibleScriptResult);
        }
        self.script_results.insert(initial_age_yr, result);
        // any previous fit no longer reflects the data
        self.fitted = None;
        self.model_comparison = None;
        Ok(())
    }

    /// Output types available across the stored result sets.
    #[must_use]
    pub fn get_possible_output_types(&self) -> Vec<String> {
        self.script_results
            .values()
            .next()
            .map(ScriptResult::output_types)
            .unwrap_or_default()
    }

    /// Whether every stored result set carries estimator variances.
    #[must_use]
    pub fn is_variance_available(&self) -> bool {
        !self.script_results.is_empty()
            && self
                .script_results
                .values()
                .all(ScriptResult::is_variance_available)
    }

    /// Fit the meta-model, reporting the outcome as a status string.
    ///
    /// Returns `"DONE"` on success and `"ERROR: <message>"` otherwise.
    pub fn fit(
        &mut self,
        output_type: &str,
        candidates: Vec<(ModelForm, Option<ParameterConfig>)>,
    ) -> String {
        match self.try_fit(output_type, candidates) {
            Ok(()) => "DONE".to_string(),
            Err(error) => format!("ERROR: {error}"),
        }
    }

    /// Fit the meta-model over the candidate model forms.
    ///
    /// One worker thread runs the Metropolis-Hastings chain of each
    /// candidate; converged candidates are ranked by LPML and the winner is
    /// promoted to the read-only fitted state.
    ///
    /// # Errors
    ///
    /// Configuration problems (unknown output type, bad parameter maps,
    /// invalid sampler settings) surface as typed errors before any chain
    /// starts. Chains that fail at runtime are recorded as non-converged;
    /// `NoCandidateConverged` is returned when none survives.
    pub fn try_fit(
        &mut self,
        output_type: &str,
        candidates: Vec<(ModelForm, Option<ParameterConfig>)>,
    ) -> Result<(), MetaModelError> {
        self.fitted = None;
        self.model_comparison = None;
        self.mh_parameters.validate()?;
        if self.script_results.is_empty() {
            return Err(MetaModelError::EmptyScriptResults);
        }
        info!(
            "Meta-model {}: modeling output type {output_type}",
            self.stratum_group
        );

        let mut forms = Vec::with_capacity(candidates.len());
        let mut models = Vec::with_capacity(candidates.len());
        for (form, config) in candidates {
            let records = config.map(ParameterConfig::into_records).transpose()?;
            let model = CandidateModel::new(
                form,
                output_type,
                &self.stratum_group,
                &self.script_results,
                self.estimate_residual_variance,
                records,
            )?;
            forms.push(form);
            models.push(model);
        }
        if models.is_empty() {
            return Err(MetaModelError::NoCandidateConverged);
        }

        let sim = self.mh_parameters;
        let mut worker_results: Vec<Option<(CandidateModel, MetropolisHastingsEstimate)>> =
            (0..models.len()).map(|_| None).collect();
        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(models.len());
            for (index, mut model) in models.into_iter().enumerate() {
                let seed = sim
                    .seed
                    .wrapping_add(u64::try_from(index).unwrap_or(0) * WORKER_SEED_STRIDE);
                handles.push((
                    index,
                    scope.spawn(move || {
                        let estimate = run_estimation(&mut model, &sim, seed);
                        (model, estimate)
                    }),
                ));
            }
            for (index, handle) in handles {
                match handle.join() {
                    Ok(result) => worker_results[index] = Some(result),
                    Err(_) => {
                        warn!(
                            "Meta-model {}: worker for {} panicked",
                            self.stratum_group, forms[index]
                        );
                    }
                }
            }
        });

        let mut converged: Vec<(CandidateModel, MetropolisHastingsEstimate)> = Vec::new();
        let mut failed_forms: Vec<ModelForm> = Vec::new();
        for (index, result) in worker_results.into_iter().enumerate() {
            match result {
                Some((model, estimate)) if estimate.converged => {
                    converged.push((model, estimate));
                }
                _ => failed_forms.push(forms[index]),
            }
        }
        // stable sort keeps first-seen order on LPML ties
        converged.sort_by(|left, right| {
            right
                .1
                .log_pseudomarginal_likelihood
                .total_cmp(&left.1.log_pseudomarginal_likelihood)
        });

        let max_lpml = converged
            .iter()
            .map(|(_, estimate)| estimate.log_pseudomarginal_likelihood)
            .fold(f64::NEG_INFINITY, f64::max);
        let weight_norm: f64 = converged
            .iter()
            .map(|(_, estimate)| (estimate.log_pseudomarginal_likelihood - max_lpml).exp())
            .sum();
        let mut comparison: Vec<ModelComparisonRow> = converged
            .iter()
            .map(|(model, estimate)| ModelComparisonRow {
                model_form: model.form,
                lpml: Some(estimate.log_pseudomarginal_likelihood),
                weight: (estimate.log_pseudomarginal_likelihood - max_lpml).exp() / weight_norm,
                converged: true,
            })
            .collect();
        comparison.extend(failed_forms.iter().map(|&form| ModelComparisonRow {
            model_form: form,
            lpml: None,
            weight: 0.0,
            converged: false,
        }));
        self.model_comparison = Some(comparison);

        let Some((winner, estimate)) = converged.into_iter().next() else {
            return Err(MetaModelError::NoCandidateConverged);
        };
        info!(
            "Meta-model {}: selected model is {}",
            self.stratum_group, winner.form
        );

        let dimension = winner.layout.total_length();
        self.fitted = Some(FittedMetaModel {
            form: winner.form,
            output_type: winner.output_type.clone(),
            parameter_names: winner.layout.full_names(&winner.blocks),
            n_fixed_effects: winner.layout.n_fixed_effects,
            sigma_u_index: winner.layout.sigma_u_index,
            reg_lag_index: winner.layout.reg_lag_index,
            final_parameter_estimates: column_entries(&estimate.final_parameter_estimates),
            parameter_covariance: (0..dimension)
                .map(|i| {
                    (0..dimension)
                        .map(|j| estimate.parameter_covariance[(i, j)])
                        .collect()
                })
                .collect(),
            log_pseudomarginal_likelihood: estimate.log_pseudomarginal_likelihood,
            acceptance_rate: estimate.acceptance_rate,
            final_sample: Some(estimate.final_sample.iter().map(column_entries).collect()),
            observations: winner.observations,
        });
        Ok(())
    }

    /// Output type selected by the last successful fit.
    #[must_use]
    pub fn get_selected_output_type(&self) -> &str {
        self.fitted
            .as_ref()
            .map_or("", |fitted| fitted.output_type.as_str())
    }

    /// Selected model form, once fitted.
    #[must_use]
    pub fn get_selected_model_form(&self) -> Option<ModelForm> {
        self.fitted.as_ref().map(|fitted| fitted.form)
    }

    /// Point estimates of the selected model, in parameter order.
    #[must_use]
    pub fn get_final_parameter_estimates(&self) -> Option<&[f64]> {
        self.fitted
            .as_ref()
            .map(|fitted| fitted.final_parameter_estimates.as_slice())
    }

    /// Parameter names of the selected model, in parameter order.
    #[must_use]
    pub fn get_parameter_names(&self) -> Option<&[String]> {
        self.fitted
            .as_ref()
            .map(|fitted| fitted.parameter_names.as_slice())
    }

    /// Model-comparison table of the last fit.
    #[must_use]
    pub fn get_model_comparison(&self) -> Option<&[ModelComparisonRow]> {
        self.model_comparison.as_deref()
    }

    fn converged_model(&self) -> Result<&FittedMetaModel, MetaModelError> {
        self.fitted.as_ref().ok_or(MetaModelError::NotFitted)
    }

    /// Deterministic point prediction with the regeneration lag applied.
    ///
    /// # Errors
    ///
    /// Returns `NotFitted` before a successful fit.
    pub fn get_prediction(
        &self,
        age_yr: f64,
        time_since_initial_date_yr: f64,
    ) -> Result<f64, MetaModelError> {
        Ok(self
            .converged_model()?
            .predict(age_yr, time_since_initial_date_yr, 0.0))
    }

    /// Prediction variance from the fixed-effects covariance.
    ///
    /// With `include_random_effect_variance`, mixed models add
    /// `(d mu / d b1)^2 * sigma_u^2`. A non-positive effective age yields 0.
    ///
    /// # Errors
    ///
    /// Returns `NotFitted` before a successful fit.
    pub fn get_prediction_variance(
        &self,
        age_yr: f64,
        time_since_initial_date_yr: f64,
        include_random_effect_variance: bool,
    ) -> Result<f64, MetaModelError> {
        Ok(self.converged_model()?.prediction_variance(
            age_yr,
            time_since_initial_date_yr,
            include_random_effect_variance,
        ))
    }

    /// Prediction table over several ages with the requested variance output.
    ///
    /// # Errors
    ///
    /// Returns `NotFitted` before a successful fit.
    pub fn get_predictions(
        &self,
        age_yr: &[f64],
        time_since_initial_date_yr: f64,
        variance_output: PredictionVarianceOutput,
    ) -> Result<Vec<PredictionRow>, MetaModelError> {
        let fitted = self.converged_model()?;
        Ok(age_yr
            .iter()
            .map(|&age| {
                let variance = match variance_output {
                    PredictionVarianceOutput::None => None,
                    PredictionVarianceOutput::ParameterEstimates => {
                        Some(fitted.prediction_variance(age, time_since_initial_date_yr, false))
                    }
                    PredictionVarianceOutput::ParameterEstimatesWithRandomEffect => {
                        Some(fitted.prediction_variance(age, time_since_initial_date_yr, true))
                    }
                };
                PredictionRow {
                    age_yr: age,
                    pred: fitted.predict(age, time_since_initial_date_yr, 0.0),
                    variance,
                }
            })
            .collect())
    }

    /// Monte-Carlo prediction ensemble.
    ///
    /// Each realization draws fixed effects from the Gaussian approximation
    /// of the posterior; each subject of a mixed model draws its own
    /// `u ~ N(0, sigma_u^2)`. Zero counts disable the corresponding source
    /// of variability while still producing one row per age.
    ///
    /// # Errors
    ///
    /// Returns `NotFitted` before a successful fit.
    pub fn get_monte_carlo_predictions(
        &self,
        age_yr: &[f64],
        time_since_initial_date_yr: f64,
        nb_subjects: usize,
        nb_realizations: usize,
    ) -> Result<Vec<MonteCarloPredictionRow>, MetaModelError> {
        let fitted = self.converged_model()?;
        let mut rng = StdRng::seed_from_u64(self.mh_parameters.seed);

        let parameter_variability = nb_realizations > 0;
        let random_effect_variability = nb_subjects > 0;
        let nb_realized = nb_realizations.max(1);
        let nb_subjected = nb_subjects.max(1);

        let fixed_mean = fitted.fixed_effect_mean();
        let cholesky = if parameter_variability {
            let factor = cholesky_factor(&fitted.fixed_effect_covariance());
            if factor.is_none() {
                warn!(
                    "Meta-model {}: fixed-effect covariance is not positive definite, \
                     parameter variability disabled",
                    self.stratum_group
                );
            }
            factor
        } else {
            None
        };
        let deviates: Vec<Mat<f64>> = (0..nb_realized)
            .map(|_| {
                cholesky.as_ref().map_or_else(
                    || fixed_mean.clone(),
                    |factor| {
                        let z: Vec<f64> = (0..fitted.n_fixed_effects)
                            .map(|_| draw_standard_normal(&mut rng))
                            .collect();
                        Mat::from_fn(fitted.n_fixed_effects, 1, |i, _| {
                            let mut value = fixed_mean[(i, 0)];
                            for (j, z_j) in z.iter().enumerate().take(i + 1) {
                                value += factor[(i, j)] * z_j;
                            }
                            value
                        })
                    },
                )
            })
            .collect();

        let sigma_u = fitted.sigma_u();
        let reg_lag_yr = fitted.reg_lag_yr();
        let mut rows =
            Vec::with_capacity(nb_realized * nb_subjected * age_yr.len());
        for (realization_id, deviate) in deviates.iter().enumerate() {
            for subject_id in 0..nb_subjected {
                let random_effect = if random_effect_variability {
                    sigma_u * draw_standard_normal(&mut rng)
                } else {
                    0.0
                };
                for &age in age_yr {
                    rows.push(MonteCarloPredictionRow {
                        realization_id,
                        subject_id,
                        age_yr: age,
                        pred: predict_with_lag(
                            fitted.form,
                            age,
                            time_since_initial_date_yr,
                            random_effect,
                            deviate,
                            reg_lag_yr,
                        ),
                    });
                }
            }
        }
        Ok(rows)
    }

    /// Text summary of the fitted model, derived from the point estimate and
    /// covariance only.
    ///
    /// # Errors
    ///
    /// Returns `NotFitted` before a successful fit.
    pub fn get_summary(&self) -> Result<String, MetaModelError> {
        Ok(render_summary(
            self.converged_model()?,
            &self.stratum_group,
        ))
    }

    /// Effective sample sizes of the retained chain, per parameter.
    ///
    /// # Errors
    ///
    /// Returns `NotFitted` before a successful fit, and `SampleReleased` on
    /// a light instance whose sample was dropped.
    pub fn get_chain_diagnostics(
        &self,
    ) -> Result<Vec<ParameterChainDiagnostics>, MetaModelError> {
        let fitted = self.converged_model()?;
        let sample = fitted
            .final_sample
            .as_ref()
            .ok_or(MetaModelError::SampleReleased)?;
        Ok(chain_diagnostics(&fitted.parameter_names, sample))
    }

    /// Export the retained Metropolis-Hastings sample as CSV, one column per
    /// parameter.
    ///
    /// # Errors
    ///
    /// Returns `NotFitted` before a successful fit, `SampleReleased` on a
    /// light instance, or an I/O error.
    pub fn export_metropolis_hastings_sample(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<(), MetaModelError> {
        let fitted = self.converged_model()?;
        let sample = fitted
            .final_sample
            .as_ref()
            .ok_or(MetaModelError::SampleReleased)?;
        let mut content = fitted.parameter_names.join(",");
        content.push('\n');
        for draw in sample {
            let row = draw
                .iter()
                .map(f64::to_string)
                .collect::<Vec<_>>()
                .join(",");
            content.push_str(&row);
            content.push('\n');
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Observations assembled for the fitted output type.
    ///
    /// # Errors
    ///
    /// Returns `NotFitted` before a successful fit.
    pub fn get_final_data_set(&self) -> Result<&[Observation], MetaModelError> {
        Ok(&self.converged_model()?.observations)
    }

    /// Export the assembled observations as CSV.
    ///
    /// # Errors
    ///
    /// Returns `NotFitted` before a successful fit, or an I/O error.
    pub fn export_final_data_set(&self, path: impl AsRef<Path>) -> Result<(), MetaModelError> {
        let observations = self.get_final_data_set()?;
        let mut content = String::from(
            "initialAgeYr,DateYr,timeSinceInitialDateYr,OutputType,Estimate\n",
        );
        for obs in observations {
            content.push_str(&format!(
                "{},{},{},{},{}\n",
                obs.initial_age_yr,
                obs.date_yr,
                obs.time_since_initial_date_yr,
                obs.output_type,
                obs.estimate
            ));
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Serialize to a JSON file, keeping the thinned sample.
    ///
    /// # Errors
    ///
    /// Returns serialization or I/O errors.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), MetaModelError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load a previously saved meta-model.
    ///
    /// # Errors
    ///
    /// Returns deserialization or I/O errors.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MetaModelError> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Rewrite a saved meta-model without its Metropolis-Hastings sample.
    ///
    /// The light form keeps the point estimate and covariance, so all
    /// predictions and the text summary are preserved.
    ///
    /// # Errors
    ///
    /// Returns deserialization, serialization, or I/O errors.
    pub fn convert_to_light_version(path: impl AsRef<Path>) -> Result<PathBuf, MetaModelError> {
        let mut instance = Self::load(path.as_ref())?;
        if let Some(fitted) = instance.fitted.as_mut() {
            fitted.release_final_sample();
        }
        let light_path = Self::light_version_filename(path.as_ref());
        instance.save(&light_path)?;
        Ok(light_path)
    }

    /// Filename of the light form: the `_light` suffix goes before the
    /// extension.
    #[must_use]
    pub fn light_version_filename(path: &Path) -> PathBuf {
        let extension = path.extension().and_then(|ext| ext.to_str());
        let stem = path.file_stem().and_then(|stem| stem.to_str()).unwrap_or("");
        let file_name = extension.map_or_else(
            || format!("{stem}_light"),
            |ext| format!("{stem}_light.{ext}"),
        );
        path.with_file_name(file_name)
    }
}
