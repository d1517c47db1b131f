//! Closed-form growth curves fitted by the meta-models.
//!
//! Each form provides a prediction and its fixed-effects gradient, both
//! written exactly as in the model definition. The `WithRandomEffect`
//! variants add one stratum-level deviation `u_i` to the asymptote-like
//! coefficient `b1`.

use std::fmt;
use std::str::FromStr;

use faer::Mat;
use serde::{Deserialize, Serialize};

use super::parameters::ParameterRecord;
use super::types::MetaModelError;

pub(crate) const CORRELATION_PARM: &str = "rho";
pub(crate) const RANDOM_EFFECT_STD: &str = "sigma_u";
pub(crate) const RESIDUAL_VARIANCE: &str = "sigma2_res";
pub(crate) const REG_LAG_PARM: &str = "regLag";

/// Age (yr) at or below which a stratum is likely affected by a
/// regeneration lag.
pub(crate) const REG_LAG_AGE_YR_LIMIT: u32 = 10;

/// The candidate growth-curve forms.
///
/// # Examples
///
/// ```
/// use stand_metamodels::ModelForm;
///
/// let form: ModelForm = "ChapmanRichardsWithRandomEffect".parse().unwrap();
/// assert!(form.has_random_effect());
/// assert_eq!(form.effect_list(), &["b1", "b2", "b3"]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelForm {
    ChapmanRichards,
    ChapmanRichardsWithRandomEffect,
    ChapmanRichardsDerivative,
    ChapmanRichardsDerivativeWithRandomEffect,
    Exponential,
    ExponentialWithRandomEffect,
    ModifiedChapmanRichardsDerivative,
    ModifiedChapmanRichardsDerivativeWithRandomEffect,
}

impl ModelForm {
    pub(crate) const ALL: [Self; 8] = [
        Self::ChapmanRichards,
        Self::ChapmanRichardsWithRandomEffect,
        Self::ChapmanRichardsDerivative,
        Self::ChapmanRichardsDerivativeWithRandomEffect,
        Self::Exponential,
        Self::ExponentialWithRandomEffect,
        Self::ModifiedChapmanRichardsDerivative,
        Self::ModifiedChapmanRichardsDerivativeWithRandomEffect,
    ];

    /// Whether the form carries one stratum-level random effect per block.
    #[must_use]
    pub const fn has_random_effect(self) -> bool {
        matches!(
            self,
            Self::ChapmanRichardsWithRandomEffect
                | Self::ChapmanRichardsDerivativeWithRandomEffect
                | Self::ExponentialWithRandomEffect
                | Self::ModifiedChapmanRichardsDerivativeWithRandomEffect
        )
    }

    /// Ordered fixed-effect names.
    #[must_use]
    pub const fn effect_list(self) -> &'static [&'static str] {
        match self {
            Self::Exponential | Self::ExponentialWithRandomEffect => &["b1", "b2"],
            Self::ModifiedChapmanRichardsDerivative
            | Self::ModifiedChapmanRichardsDerivativeWithRandomEffect => {
                &["b1", "b2", "b3", "b4"]
            }
            _ => &["b1", "b2", "b3"],
        }
    }

    /// One-line textual form, used in reports only.
    #[must_use]
    pub const fn definition(self) -> &'static str {
        match self {
            Self::ChapmanRichards => "y ~ b1*(1-exp(-b2*t))^b3",
            Self::ChapmanRichardsWithRandomEffect => "y ~ (b1 + u_i)*(1-exp(-b2*t))^b3",
            Self::ChapmanRichardsDerivative => "y ~ b1*exp(-b2*t)*(1-exp(-b2*t))^b3",
            Self::ChapmanRichardsDerivativeWithRandomEffect => {
                "y ~ (b1 + u_i)*exp(-b2*t)*(1-exp(-b2*t))^b3"
            }
            Self::Exponential => "y ~ b1*exp(-b2*t)",
            Self::ExponentialWithRandomEffect => "y ~ (b1 + u_i)*exp(-b2*t)",
            Self::ModifiedChapmanRichardsDerivative => "y ~ b1*exp(-b2*t)*(1-exp(-b3*t))^b4",
            Self::ModifiedChapmanRichardsDerivativeWithRandomEffect => {
                "y ~ (b1 + u_i)*exp(-b2*t)*(1-exp(-b3*t))^b4"
            }
        }
    }

    /// Prediction at a given stratum age.
    ///
    /// The age is the effective age; callers subtract the regeneration lag
    /// beforehand where it applies.
    #[must_use]
    pub(crate) fn predict(
        self,
        age_yr: f64,
        _time_since_beginning: f64,
        random_effect: f64,
        parms: &Mat<f64>,
    ) -> f64 {
        let b1 = parms[(0, 0)];
        let b2 = parms[(1, 0)];
        match self {
            Self::ChapmanRichards | Self::ChapmanRichardsWithRandomEffect => {
                let b3 = parms[(2, 0)];
                (b1 + random_effect) * (1.0 - (-b2 * age_yr).exp()).powf(b3)
            }
            Self::ChapmanRichardsDerivative | Self::ChapmanRichardsDerivativeWithRandomEffect => {
                let b3 = parms[(2, 0)];
                let exp = (-b2 * age_yr).exp();
                (b1 + random_effect) * exp * (1.0 - exp).powf(b3)
            }
            Self::Exponential | Self::ExponentialWithRandomEffect => {
                (b1 + random_effect) * (-b2 * age_yr).exp()
            }
            Self::ModifiedChapmanRichardsDerivative
            | Self::ModifiedChapmanRichardsDerivativeWithRandomEffect => {
                let b3 = parms[(2, 0)];
                let b4 = parms[(3, 0)];
                (b1 + random_effect) * (-b2 * age_yr).exp() * (1.0 - (-b3 * age_yr).exp()).powf(b4)
            }
        }
    }

    /// First derivatives with respect to the fixed effects, at a given age.
    #[must_use]
    pub(crate) fn gradient(
        self,
        age_yr: f64,
        _time_since_beginning: f64,
        random_effect: f64,
        parms: &Mat<f64>,
    ) -> Mat<f64> {
        let b1 = parms[(0, 0)] + random_effect;
        let b2 = parms[(1, 0)];
        match self {
            Self::ChapmanRichards | Self::ChapmanRichardsWithRandomEffect => {
                let b3 = parms[(2, 0)];
                let exp = (-b2 * age_yr).exp();
                let root = 1.0 - exp;
                column(&[
                    root.powf(b3),
                    b1 * b3 * root.powf(b3 - 1.0) * exp * age_yr,
                    b1 * root.powf(b3) * root.ln(),
                ])
            }
            Self::ChapmanRichardsDerivative | Self::ChapmanRichardsDerivativeWithRandomEffect => {
                let b3 = parms[(2, 0)];
                let exp = (-b2 * age_yr).exp();
                let root = 1.0 - exp;
                column(&[
                    exp * root.powf(b3),
                    b1 * age_yr * exp * (b3 * root.powf(b3 - 1.0) * exp - root.powf(b3)),
                    b1 * exp * root.powf(b3) * root.ln(),
                ])
            }
            Self::Exponential | Self::ExponentialWithRandomEffect => {
                let exp = (-b2 * age_yr).exp();
                column(&[exp, -age_yr * b1 * exp])
            }
            Self::ModifiedChapmanRichardsDerivative
            | Self::ModifiedChapmanRichardsDerivativeWithRandomEffect => {
                let b3 = parms[(2, 0)];
                let b4 = parms[(3, 0)];
                let exp_decay = (-b2 * age_yr).exp();
                let exp_rate = (-b3 * age_yr).exp();
                let root = 1.0 - exp_rate;
                column(&[
                    exp_decay * root.powf(b4),
                    -age_yr * b1 * exp_decay * root.powf(b4),
                    b1 * exp_decay * b4 * root.powf(b4 - 1.0) * exp_rate * age_yr,
                    b1 * exp_decay * root.powf(b4) * root.ln(),
                ])
            }
        }
    }

    /// Default parameter records (starting values and uniform priors).
    #[must_use]
    pub fn default_parameters(self) -> Vec<ParameterRecord> {
        let mut records = match self {
            Self::ChapmanRichards | Self::ChapmanRichardsWithRandomEffect => vec![
                ParameterRecord::uniform("b1", 100.0, 0.0, 400.0),
                ParameterRecord::uniform("b2", 0.02, 0.0001, 0.1),
                ParameterRecord::uniform("b3", 2.0, 1.0, 6.0),
                ParameterRecord::uniform(CORRELATION_PARM, 0.92, 0.80, 0.995),
            ],
            Self::ChapmanRichardsDerivative | Self::ChapmanRichardsDerivativeWithRandomEffect => {
                vec![
                    ParameterRecord::uniform("b1", 1000.0, 0.0, 2000.0),
                    ParameterRecord::uniform("b2", 0.02, 0.00001, 0.05),
                    ParameterRecord::uniform("b3", 2.0, 0.8, 6.0),
                    ParameterRecord::uniform(CORRELATION_PARM, 0.92, 0.80, 0.995),
                ]
            }
            Self::Exponential | Self::ExponentialWithRandomEffect => vec![
                ParameterRecord::uniform("b1", 2000.0, 0.0, 8000.0),
                ParameterRecord::uniform("b2", 0.005, 0.00001, 0.05),
                ParameterRecord::uniform(CORRELATION_PARM, 0.92, 0.80, 0.995),
            ],
            Self::ModifiedChapmanRichardsDerivative
            | Self::ModifiedChapmanRichardsDerivativeWithRandomEffect => vec![
                ParameterRecord::uniform("b1", 5000.0, 0.0, 10000.0),
                ParameterRecord::uniform("b2", 0.006, 0.001, 0.01),
                ParameterRecord::uniform("b3", 0.02, 0.00001, 0.2),
                ParameterRecord::uniform("b4", 1.0, 0.1, 4.0),
                ParameterRecord::uniform(CORRELATION_PARM, 0.92, 0.80, 0.995),
            ],
        };
        if self.has_random_effect() {
            records.push(self.default_random_effect_std());
        }
        records.push(self.default_residual_variance());
        records
    }

    fn default_random_effect_std(self) -> ParameterRecord {
        match self {
            Self::ChapmanRichardsWithRandomEffect => {
                ParameterRecord::uniform(RANDOM_EFFECT_STD, 15.0, 0.0, 100.0)
            }
            Self::ChapmanRichardsDerivativeWithRandomEffect => {
                ParameterRecord::uniform(RANDOM_EFFECT_STD, 50.0, 0.0, 200.0)
            }
            Self::ExponentialWithRandomEffect => {
                ParameterRecord::uniform(RANDOM_EFFECT_STD, 1000.0, 0.0, 3000.0)
            }
            _ => ParameterRecord::uniform(RANDOM_EFFECT_STD, 500.0, 0.0, 2000.0),
        }
    }

    fn default_residual_variance(self) -> ParameterRecord {
        match self {
            Self::Exponential | Self::ExponentialWithRandomEffect => {
                ParameterRecord::uniform(RESIDUAL_VARIANCE, 10000.0, 0.0, 20000.0)
            }
            Self::ModifiedChapmanRichardsDerivative
            | Self::ModifiedChapmanRichardsDerivativeWithRandomEffect => {
                ParameterRecord::uniform(RESIDUAL_VARIANCE, 2500.0, 0.0, 5000.0)
            }
            _ => ParameterRecord::uniform(RESIDUAL_VARIANCE, 250.0, 0.0, 5000.0),
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::ChapmanRichards => "ChapmanRichards",
            Self::ChapmanRichardsWithRandomEffect => "ChapmanRichardsWithRandomEffect",
            Self::ChapmanRichardsDerivative => "ChapmanRichardsDerivative",
            Self::ChapmanRichardsDerivativeWithRandomEffect => {
                "ChapmanRichardsDerivativeWithRandomEffect"
            }
            Self::Exponential => "Exponential",
            Self::ExponentialWithRandomEffect => "ExponentialWithRandomEffect",
            Self::ModifiedChapmanRichardsDerivative => "ModifiedChapmanRichardsDerivative",
            Self::ModifiedChapmanRichardsDerivativeWithRandomEffect => {
                "ModifiedChapmanRichardsDerivativeWithRandomEffect"
            }
        }
    }
}

impl fmt::Display for ModelForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelForm {
    type Err = MetaModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|form| form.name() == value)
            .ok_or_else(|| MetaModelError::UnknownModelForm(value.to_string()))
    }
}

fn column(values: &[f64]) -> Mat<f64> {
    Mat::from_fn(values.len(), 1, |row, _| values[row])
}
