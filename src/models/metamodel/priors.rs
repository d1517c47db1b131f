//! Prior specifications for the Metropolis-Hastings sampler.
//!
//! Fixed parameters carry uniform priors. Mixed models add one hierarchical
//! slot per data block: the block deviation `u_i` has an effective prior of
//! `N(0, sigma_u^2)`, with `sigma_u` itself a sampled parameter.

use faer::Mat;
use rand::Rng;
use rand::rngs::StdRng;
use statrs::distribution::{Continuous, Normal};

use crate::utils::{column_from_slice, draw_standard_normal};

/// A uniform prior over `[lower, upper]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UniformPrior {
    pub lower: f64,
    pub upper: f64,
}

impl UniformPrior {
    #[must_use]
    pub const fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    #[must_use]
    pub fn log_density(&self, value: f64) -> f64 {
        if (self.lower..=self.upper).contains(&value) {
            -(self.upper - self.lower).ln()
        } else {
            f64::NEG_INFINITY
        }
    }

    pub(crate) fn sample(&self, rng: &mut StdRng) -> f64 {
        self.lower + (self.upper - self.lower) * rng.random::<f64>()
    }
}

/// Log-density of a block deviation under `N(0, sigma_u^2)`.
#[must_use]
pub(crate) fn log_random_effect_density(value: f64, sigma_u: f64) -> f64 {
    Normal::new(0.0, sigma_u).map_or(f64::NEG_INFINITY, |normal| normal.ln_pdf(value))
}

/// Priors over one candidate model's parameter vector.
#[derive(Debug, Clone, Default)]
pub(crate) struct PriorHandler {
    fixed: Vec<(usize, UniformPrior)>,
    random_effect_indices: Vec<usize>,
    sigma_u_index: Option<usize>,
}

impl PriorHandler {
    pub(crate) fn add_fixed_effect(&mut self, index: usize, prior: UniformPrior) {
        self.fixed.push((index, prior));
    }

    pub(crate) fn add_random_effect(&mut self, index: usize, sigma_u_index: usize) {
        self.random_effect_indices.push(index);
        self.sigma_u_index = Some(sigma_u_index);
    }

    pub(crate) fn total_length(&self) -> usize {
        self.fixed.len() + self.random_effect_indices.len()
    }

    /// Joint log-density of the priors at `parms`.
    pub(crate) fn log_density(&self, parms: &Mat<f64>) -> f64 {
        let mut sum = 0.0;
        for (index, prior) in &self.fixed {
            sum += prior.log_density(parms[(*index, 0)]);
            if sum == f64::NEG_INFINITY {
                return sum;
            }
        }
        if let Some(sigma_u_index) = self.sigma_u_index {
            let sigma_u = parms[(sigma_u_index, 0)];
            if sigma_u <= 0.0 && !self.random_effect_indices.is_empty() {
                return f64::NEG_INFINITY;
            }
            for index in &self.random_effect_indices {
                sum += log_random_effect_density(parms[(*index, 0)], sigma_u);
            }
        }
        sum
    }

    /// One random draw from the priors, used to seed the grid search.
    ///
    /// Random-effect slots are drawn from `N(0, sigma_u^2)` using the
    /// `sigma_u` drawn for the same vector.
    pub(crate) fn draw(&self, rng: &mut StdRng) -> Mat<f64> {
        let mut values = vec![0.0; self.total_length()];
        for (index, prior) in &self.fixed {
            values[*index] = prior.sample(rng);
        }
        if let Some(sigma_u_index) = self.sigma_u_index {
            let sigma_u = values[sigma_u_index].max(0.0);
            for index in &self.random_effect_indices {
                values[*index] = sigma_u * draw_standard_normal(rng);
            }
        }
        column_from_slice(&values)
    }
}
