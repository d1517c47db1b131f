//! Chain diagnostics for the retained Metropolis-Hastings sample.

use crate::utils::usize_to_f64;

/// Lag-`k` autocorrelation for a scalar chain.
#[must_use]
pub fn autocorrelation(series: &[f64], lag: usize) -> f64 {
    if series.is_empty() || lag >= series.len() {
        return 0.0;
    }

    let n = series.len() - lag;
    let mean = series.iter().sum::<f64>() / usize_to_f64(series.len());

    let mut denominator = 0.0;
    for value in series {
        let centered = value - mean;
        denominator += centered * centered;
    }
    if denominator <= 0.0 {
        return 0.0;
    }

    let mut numerator = 0.0;
    for idx in 0..n {
        numerator += (series[idx] - mean) * (series[idx + lag] - mean);
    }
    numerator / denominator
}

/// Heuristic effective sample size using positive autocorrelation truncation.
#[must_use]
pub fn effective_sample_size(series: &[f64]) -> f64 {
    let n = series.len();
    if n < 2 {
        return usize_to_f64(n);
    }

    let mut rho_sum = 0.0;
    for lag in 1..n {
        let rho = autocorrelation(series, lag);
        if rho <= 0.0 {
            break;
        }
        rho_sum += rho;
    }

    usize_to_f64(n) / (2.0f64.mul_add(rho_sum, 1.0)).max(1.0)
}

/// Effective sample size of one named parameter chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterChainDiagnostics {
    pub parameter: String,
    pub effective_sample_size: f64,
}

/// Per-parameter diagnostics over a column-wise retained sample.
#[must_use]
pub(crate) fn chain_diagnostics(
    parameter_names: &[String],
    final_sample: &[Vec<f64>],
) -> Vec<ParameterChainDiagnostics> {
    parameter_names
        .iter()
        .enumerate()
        .map(|(index, name)| {
            let series: Vec<f64> = final_sample.iter().map(|draw| draw[index]).collect();
            ParameterChainDiagnostics {
                parameter: name.clone(),
                effective_sample_size: effective_sample_size(&series),
            }
        })
        .collect()
}
