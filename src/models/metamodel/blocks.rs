//! Per-block residual covariance and log-likelihood evaluation.
//!
//! Each block covers the repeated measurements of one `(initial age,
//! output type)` cohort. Its covariance decomposes as the outer product of
//! residual standard deviations times an AR(1) correlation in the unit age
//! lag, which keeps both the inverse and the log-determinant in closed form.

use faer::Mat;

use crate::models::matrix_ops::ar1_inverse;

use super::structure::{DataBlock, Observation};
use super::types::MetaModelError;

#[derive(Debug, Clone)]
pub(crate) struct DataBlockWrapper {
    pub block_id: String,
    pub initial_age_yr: u32,
    pub age_yr: Vec<f64>,
    pub time_since_beginning: Vec<f64>,
    pub vec_y: Mat<f64>,
    pub nb_plots: usize,
    /// Residual standard deviations fixed at construction when the simulator
    /// provides estimator variances.
    fixed_residual_std: Option<Vec<f64>>,
    inv_var_cov: Mat<f64>,
    ln_constant: f64,
}

impl DataBlockWrapper {
    pub(crate) fn new(
        block: &DataBlock,
        observations: &[Observation],
        overall_var_cov: Option<&Mat<f64>>,
    ) -> Self {
        let age_yr: Vec<f64> = block
            .indices
            .iter()
            .map(|&row| observations[row].stratum_age_yr())
            .collect();
        let time_since_beginning: Vec<f64> = block
            .indices
            .iter()
            .map(|&row| f64::from(observations[row].time_since_initial_date_yr))
            .collect();
        let vec_y = Mat::from_fn(block.indices.len(), 1, |i, _| {
            observations[block.indices[i]].estimate
        });
        let fixed_residual_std = overall_var_cov.map(|var_cov| {
            block
                .indices
                .iter()
                .map(|&row| var_cov[(row, row)].max(0.0).sqrt())
                .collect()
        });
        Self {
            block_id: block.block_id.clone(),
            initial_age_yr: block.initial_age_yr,
            age_yr,
            time_since_beginning,
            vec_y,
            nb_plots: block.nb_plots,
            fixed_residual_std,
            inv_var_cov: Mat::zeros(block.indices.len(), block.indices.len()),
            ln_constant: f64::NAN,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.vec_y.nrows()
    }

    pub(crate) const fn ln_constant(&self) -> f64 {
        self.ln_constant
    }

    /// Recompute the cached inverse covariance and normalizing constant.
    ///
    /// `residual_variance` is the estimated `sigma2_res`, used only when the
    /// simulator did not provide estimator variances; the per-row standard
    /// deviation is then `sqrt(sigma2_res / nb_plots)`.
    pub(crate) fn update_cov_mat(&mut self, rho: f64, residual_variance: Option<f64>) {
        let size = self.size();
        let std: Vec<f64> = match (&self.fixed_residual_std, residual_variance) {
            (Some(fixed), _) => fixed.clone(),
            (None, Some(variance)) => {
                let scaled = (variance / crate::utils::usize_to_f64(self.nb_plots)).max(0.0);
                vec![scaled.sqrt(); size]
            }
            (None, None) => vec![1.0; size],
        };
        let inv_correlation = ar1_inverse(size, rho);
        self.inv_var_cov = Mat::from_fn(size, size, |i, j| {
            inv_correlation[(i, j)] / (std[i] * std[j])
        });
        let ln_det_std: f64 = std.iter().map(|s| s.ln()).sum();
        let ln_det = 2.0 * ln_det_std
            + crate::utils::usize_to_f64(size - 1) * (1.0 - rho * rho).ln();
        self.ln_constant = -0.5 * crate::utils::usize_to_f64(size) * std::f64::consts::TAU.ln()
            - 0.5 * ln_det;
    }

    /// Block log-likelihood for the given prediction vector.
    ///
    /// # Errors
    ///
    /// Returns `NegativeQuadraticForm` if the residual quadratic form turns
    /// negative, which indicates numerical breakdown.
    pub(crate) fn log_likelihood(&self, predictions: &Mat<f64>) -> Result<f64, MetaModelError> {
        let size = self.size();
        let mut quadratic = 0.0;
        for i in 0..size {
            let residual_i = self.vec_y[(i, 0)] - predictions[(i, 0)];
            for j in 0..size {
                let residual_j = self.vec_y[(j, 0)] - predictions[(j, 0)];
                quadratic += residual_i * self.inv_var_cov[(i, j)] * residual_j;
            }
        }
        if quadratic < 0.0 {
            return Err(MetaModelError::NegativeQuadraticForm);
        }
        Ok(self.ln_constant - 0.5 * quadratic)
    }
}
