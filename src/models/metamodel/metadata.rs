//! Metadata block describing a fitted meta-model.
//!
//! The metadata is emitted alongside a saved meta-model so downstream tools
//! can identify the simulation origin and fit without deserializing the
//! model itself.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::meta_model::MetaModel;

/// Simulation-origin block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrowthMetaData {
    pub geo_domain: String,
    pub data_source: String,
    /// Calendar years covered by each initial-age result set.
    pub data_source_years: BTreeMap<u32, Vec<i32>>,
    pub nb_realizations: usize,
    pub climate_change_option: String,
    pub growth_model: String,
    /// Variance-estimator label of each initial-age result set.
    pub upscaling: BTreeMap<u32, String>,
    pub nb_plots: BTreeMap<u32, usize>,
}

/// Fit block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitMetaData {
    pub time_stamp: Option<String>,
    pub output_type: String,
    pub fit_model: String,
    pub stratum_group: String,
    pub leading_species: Option<String>,
}

/// Metadata emitted alongside a saved meta-model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaModelMetaData {
    pub growth: GrowthMetaData,
    pub fit: FitMetaData,
}

impl MetaModelMetaData {
    /// Build the metadata for a meta-model instance.
    #[must_use]
    pub fn generate(meta_model: &MetaModel, leading_species: Option<String>) -> Self {
        let mut growth = GrowthMetaData {
            geo_domain: meta_model.geo_domain().to_string(),
            data_source: meta_model.data_source().to_string(),
            ..GrowthMetaData::default()
        };
        for (index, (&initial_age_yr, result)) in meta_model.script_results().iter().enumerate() {
            if index == 0 {
                growth.nb_realizations = result.nb_realizations();
                growth.climate_change_option = result.climate_change_scenario().to_string();
                growth.growth_model = result.growth_model().to_string();
            }
            let mut years: Vec<i32> = Vec::new();
            for record in result.dataset() {
                if !years.contains(&record.date_yr) {
                    years.push(record.date_yr);
                }
            }
            growth.data_source_years.insert(initial_age_yr, years);
            if let Some(estimator) = result.variance_estimator_type() {
                growth.upscaling.insert(initial_age_yr, estimator.to_string());
            }
            growth.nb_plots.insert(initial_age_yr, result.nb_plots());
        }

        let fit = FitMetaData {
            time_stamp: meta_model.last_fit_time_stamp().map(str::to_string),
            output_type: meta_model.get_selected_output_type().to_string(),
            fit_model: meta_model
                .get_selected_model_form()
                .map(|form| form.to_string())
                .unwrap_or_default(),
            stratum_group: meta_model.stratum_group().to_string(),
            leading_species,
        };

        Self { growth, fit }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{ScriptResult, ScriptResultRecord};

    fn record(date_yr: i32, time_since: i32) -> ScriptResultRecord {
        ScriptResultRecord {
            date_yr,
            time_since_initial_date_yr: time_since,
            output_type: "AliveVolume_AllSpecies".to_string(),
            estimate: 25.0,
            variance: Some(1.0),
            variance_estimator_type: "LeaveOneOut".to_string(),
        }
    }

    #[test]
    fn generate_collects_per_age_years_and_plots() {
        let mut meta_model = MetaModel::new("RE2", "QC", "TSP4");
        meta_model
            .add_script_result(
                30,
                ScriptResult::new(
                    500,
                    20,
                    "NoChange".to_string(),
                    "Artemis".to_string(),
                    vec![record(2000, 0), record(2010, 10), record(2010, 10)],
                ),
            )
            .expect("first result always fits");
        meta_model
            .add_script_result(
                50,
                ScriptResult::new(
                    500,
                    25,
                    "NoChange".to_string(),
                    "Artemis".to_string(),
                    vec![record(2000, 0)],
                ),
            )
            .expect("compatible result");

        let metadata = MetaModelMetaData::generate(&meta_model, Some("BS".to_string()));
        assert_eq!(metadata.growth.geo_domain, "QC");
        assert_eq!(metadata.growth.nb_realizations, 500);
        assert_eq!(metadata.growth.growth_model, "Artemis");
        assert_eq!(metadata.growth.data_source_years[&30], vec![2000, 2010]);
        assert_eq!(metadata.growth.nb_plots[&50], 25);
        assert_eq!(metadata.growth.upscaling[&30], "LeaveOneOut");
        assert_eq!(metadata.fit.stratum_group, "RE2");
        assert_eq!(metadata.fit.leading_species.as_deref(), Some("BS"));
        // not fitted yet
        assert!(metadata.fit.fit_model.is_empty());
        assert!(metadata.fit.time_stamp.is_none());
    }
}
