//! Parameter-map handling for the meta-model implementations.
//!
//! Starting values and priors are enumerated as
//! `{Parameter, StartingValue, Distribution, DistParms}` records, either as
//! typed values or as a JSON string. `Uniform` is the only distribution kind
//! currently recognized.

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use super::priors::UniformPrior;
use super::types::MetaModelError;

/// One starting-value/prior record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRecord {
    #[serde(rename = "Parameter")]
    pub parameter: String,
    #[serde(rename = "StartingValue", deserialize_with = "lenient_f64")]
    pub starting_value: f64,
    #[serde(rename = "Distribution")]
    pub distribution: String,
    #[serde(rename = "DistParms", deserialize_with = "lenient_f64_vec")]
    pub dist_parms: Vec<f64>,
}

impl ParameterRecord {
    #[must_use]
    pub fn uniform(parameter: &str, starting_value: f64, lower: f64, upper: f64) -> Self {
        Self {
            parameter: parameter.to_string(),
            starting_value,
            distribution: "Uniform".to_string(),
            dist_parms: vec![lower, upper],
        }
    }
}

/// Starting values for one model form: either typed records or a JSON string
/// encoding the same array.
#[derive(Debug, Clone)]
pub enum ParameterConfig {
    Records(Vec<ParameterRecord>),
    Json(String),
}

impl ParameterConfig {
    /// # Errors
    ///
    /// Returns `MetaModelError::InvalidParameterConfig` if the JSON form does
    /// not parse into parameter records.
    pub fn into_records(self) -> Result<Vec<ParameterRecord>, MetaModelError> {
        match self {
            Self::Records(records) => Ok(records),
            Self::Json(text) => serde_json::from_str(&text)
                .map_err(|error| MetaModelError::InvalidParameterConfig(error.to_string())),
        }
    }
}

/// A validated record: starting value plus prior distribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct FormattedParameter {
    pub starting_value: f64,
    pub prior: UniformPrior,
}

/// Validate records against a model's parameter names and index them by name.
///
/// Every name in `parameter_names` must be covered by a record unless it is
/// listed in `nuisance_parms`.
pub(crate) fn format_parameters_map(
    records: &[ParameterRecord],
    parameter_names: &[String],
    nuisance_parms: &[&str],
) -> Result<BTreeMap<String, FormattedParameter>, MetaModelError> {
    let mut map = BTreeMap::new();
    for record in records {
        map.insert(record.parameter.clone(), format_record(record)?);
    }
    for name in parameter_names {
        if !map.contains_key(name) && !nuisance_parms.contains(&name.as_str()) {
            return Err(MetaModelError::MissingParameter(name.clone()));
        }
    }
    Ok(map)
}

fn format_record(record: &ParameterRecord) -> Result<FormattedParameter, MetaModelError> {
    if record.distribution != "Uniform" {
        return Err(MetaModelError::UnsupportedDistribution(
            record.distribution.clone(),
        ));
    }
    if record.dist_parms.len() != 2 {
        return Err(MetaModelError::InvalidDistributionParameters {
            name: record.parameter.clone(),
            expected: 2,
            found: record.dist_parms.len(),
        });
    }
    Ok(FormattedParameter {
        starting_value: record.starting_value,
        prior: UniformPrior::new(record.dist_parms[0], record.dist_parms[1]),
    })
}

// The JSON emitted by upstream tooling carries numbers as strings
// (e.g. "0.02", ["0", "400"]); accept both encodings.
fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(f64),
        Text(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(value) => Ok(value),
        NumberOrString::Text(text) => text.parse().map_err(D::Error::custom),
    }
}

fn lenient_f64_vec<'de, D>(deserializer: D) -> Result<Vec<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(f64),
        Text(String),
    }

    let raw = Vec::<NumberOrString>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|entry| match entry {
            NumberOrString::Number(value) => Ok(value),
            NumberOrString::Text(text) => text.parse().map_err(D::Error::custom),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_string()).collect()
    }

    #[test]
    fn json_records_accept_string_encoded_numbers() {
        let json = r#"[
            {"Parameter": "b1", "StartingValue": "710", "Distribution": "Uniform", "DistParms": ["0", "2000"]},
            {"Parameter": "b2", "StartingValue": 0.008, "Distribution": "Uniform", "DistParms": [0.00001, 0.05]}
        ]"#;
        let records = ParameterConfig::Json(json.to_string())
            .into_records()
            .expect("JSON should parse");
        assert_eq!(records.len(), 2);
        assert_relative_eq!(records[0].starting_value, 710.0);
        assert_relative_eq!(records[0].dist_parms[1], 2000.0);
        assert_relative_eq!(records[1].starting_value, 0.008);
    }

    #[test]
    fn malformed_json_is_a_configuration_error() {
        let error = ParameterConfig::Json("not json".to_string())
            .into_records()
            .expect_err("parse should fail");
        assert!(matches!(error, MetaModelError::InvalidParameterConfig(_)));
    }

    #[test]
    fn unsupported_distribution_is_rejected() {
        let record = ParameterRecord {
            parameter: "b1".to_string(),
            starting_value: 100.0,
            distribution: "Gaussian".to_string(),
            dist_parms: vec![0.0, 1.0],
        };
        let error = format_parameters_map(&[record], &names(&["b1"]), &[])
            .expect_err("Gaussian prior should be rejected");
        assert!(matches!(error, MetaModelError::UnsupportedDistribution(_)));
    }

    #[test]
    fn missing_parameter_is_rejected_unless_nuisance() {
        let records = vec![ParameterRecord::uniform("b1", 100.0, 0.0, 400.0)];
        let error = format_parameters_map(&records, &names(&["b1", "rho"]), &["regLag"])
            .expect_err("rho is missing from the map");
        assert!(matches!(error, MetaModelError::MissingParameter(name) if name == "rho"));

        let map = format_parameters_map(&records, &names(&["b1", "regLag"]), &["regLag"])
            .expect("regLag is nuisance");
        assert!(map.contains_key("b1"));
        assert!(!map.contains_key("regLag"));
    }

    #[test]
    fn uniform_bounds_become_the_prior() {
        let records = vec![ParameterRecord::uniform("rho", 0.92, 0.80, 0.995)];
        let map = format_parameters_map(&records, &names(&["rho"]), &[]).expect("valid map");
        let rho = map.get("rho").expect("rho present");
        assert_relative_eq!(rho.prior.lower, 0.80);
        assert_relative_eq!(rho.prior.upper, 0.995);
        assert_relative_eq!(rho.starting_value, 0.92);
    }

    #[test]
    fn wrong_dist_parms_count_is_rejected() {
        let record = ParameterRecord {
            parameter: "b1".to_string(),
            starting_value: 100.0,
            distribution: "Uniform".to_string(),
            dist_parms: vec![0.0],
        };
        let error = format_parameters_map(&[record], &names(&["b1"]), &[])
            .expect_err("one bound should be rejected");
        assert!(matches!(
            error,
            MetaModelError::InvalidDistributionParameters { found: 1, .. }
        ));
    }
}
