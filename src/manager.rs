//! Registry of fitted meta-models, indexed by stratum group.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::models::metamodel::{MetaModel, MetaModelError};

/// Keeps the meta-models of several stratum groups and dispatches
/// prediction requests to them.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MetaModelManager {
    meta_models: BTreeMap<String, MetaModel>,
}

impl MetaModelManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a meta-model under its stratum group, replacing any
    /// previous entry.
    pub fn add_meta_model(&mut self, meta_model: MetaModel) {
        self.meta_models
            .insert(meta_model.stratum_group().to_string(), meta_model);
    }

    #[must_use]
    pub fn get(&self, stratum_group: &str) -> Option<&MetaModel> {
        self.meta_models.get(stratum_group)
    }

    #[must_use]
    pub fn get_mut(&mut self, stratum_group: &str) -> Option<&mut MetaModel> {
        self.meta_models.get_mut(stratum_group)
    }

    /// Registered stratum groups, in lexical order.
    #[must_use]
    pub fn stratum_groups(&self) -> Vec<&str> {
        self.meta_models.keys().map(String::as_str).collect()
    }

    fn require(&self, stratum_group: &str) -> Result<&MetaModel, MetaModelError> {
        self.meta_models
            .get(stratum_group)
            .ok_or_else(|| MetaModelError::UnknownStratumGroup(stratum_group.to_string()))
    }

    /// Prediction from the meta-model of one stratum group.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStratumGroup` for an unregistered group, or
    /// `NotFitted` if that meta-model has not converged.
    pub fn get_prediction(
        &self,
        stratum_group: &str,
        age_yr: f64,
        time_since_initial_date_yr: f64,
    ) -> Result<f64, MetaModelError> {
        self.require(stratum_group)?
            .get_prediction(age_yr, time_since_initial_date_yr)
    }

    /// Output types available for one stratum group.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStratumGroup` for an unregistered group.
    pub fn get_possible_output_types(
        &self,
        stratum_group: &str,
    ) -> Result<Vec<String>, MetaModelError> {
        Ok(self.require(stratum_group)?.get_possible_output_types())
    }

    /// Serialize the whole registry to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns serialization or I/O errors.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), MetaModelError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load a registry saved with [`MetaModelManager::save`].
    ///
    /// # Errors
    ///
    /// Returns deserialization or I/O errors.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MetaModelError> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}
