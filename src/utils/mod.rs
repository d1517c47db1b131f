//! # Utilities
//!
//! Shared helpers for summary statistics over parameter samples and for
//! working with faer matrices.

use faer::Mat;
use rand::Rng;
use rand::rngs::StdRng;

#[must_use]
pub fn matrix_is_finite(matrix: &Mat<f64>) -> bool {
    for i in 0..matrix.nrows() {
        for j in 0..matrix.ncols() {
            if !matrix[(i, j)].is_finite() {
                return false;
            }
        }
    }
    true
}

/// # Panics
///
/// Panics if `samples` is empty.
#[must_use]
pub fn mean_vector(samples: &[Mat<f64>]) -> Mat<f64> {
    assert!(
        !samples.is_empty(),
        "mean_vector requires at least one sample"
    );
    let mut mean = Mat::<f64>::zeros(samples[0].nrows(), 1);
    for sample in samples {
        for i in 0..sample.nrows() {
            mean[(i, 0)] += sample[(i, 0)];
        }
    }
    for i in 0..mean.nrows() {
        mean[(i, 0)] /= usize_to_f64(samples.len());
    }
    mean
}

/// Sample covariance over a collection of column vectors.
///
/// Uses the `n - 1` denominator; a single sample yields the zero matrix.
#[must_use]
pub fn covariance_matrix(samples: &[Mat<f64>], mean: &Mat<f64>) -> Mat<f64> {
    let dim = mean.nrows();
    let mut covariance = Mat::<f64>::zeros(dim, dim);
    if samples.len() < 2 {
        return covariance;
    }
    for sample in samples {
        for i in 0..dim {
            let centered_i = sample[(i, 0)] - mean[(i, 0)];
            for j in 0..dim {
                covariance[(i, j)] += centered_i * (sample[(j, 0)] - mean[(j, 0)]);
            }
        }
    }
    let denominator = usize_to_f64(samples.len()) - 1.0;
    for i in 0..dim {
        for j in 0..dim {
            covariance[(i, j)] /= denominator;
        }
    }
    covariance
}

/// Lower-triangular factor `L` with `L * L^T` equal to the input, or `None`
/// when the matrix is not symmetric positive definite.
///
/// Proceeds column by column: the diagonal entry of a column must stay
/// strictly positive once the contributions of the previous columns are
/// removed, and the entries below it are scaled by that diagonal.
#[must_use]
pub fn cholesky_factor(matrix: &Mat<f64>) -> Option<Mat<f64>> {
    let n = matrix.nrows();
    if matrix.ncols() != n {
        return None;
    }
    let mut factor = Mat::<f64>::zeros(n, n);
    for col in 0..n {
        let mut pivot = matrix[(col, col)];
        for prev in 0..col {
            pivot -= factor[(col, prev)] * factor[(col, prev)];
        }
        if !(pivot > 0.0) {
            return None;
        }
        let scale = pivot.sqrt();
        factor[(col, col)] = scale;
        for row in col + 1..n {
            let mut off_diagonal = matrix[(row, col)];
            for prev in 0..col {
                off_diagonal -= factor[(row, prev)] * factor[(col, prev)];
            }
            factor[(row, col)] = off_diagonal / scale;
        }
    }
    Some(factor)
}

/// Numerically stable `log(sum(exp(values)))`.
#[must_use]
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|value| (value - max).exp()).sum();
    max + sum.ln()
}

#[must_use]
pub fn column_from_slice(values: &[f64]) -> Mat<f64> {
    Mat::from_fn(values.len(), 1, |row, _| values[row])
}

#[must_use]
pub fn column_entries(column: &Mat<f64>) -> Vec<f64> {
    let mut entries = Vec::with_capacity(column.nrows());
    for row in 0..column.nrows() {
        entries.push(column[(row, 0)]);
    }
    entries
}

#[must_use]
pub fn usize_to_f64(value: usize) -> f64 {
    f64::from(u32::try_from(value).unwrap_or(u32::MAX))
}

/// One standard-normal deviate, drawn with the Marsaglia polar method.
///
/// Rejects points outside the open unit disc, so the number of uniform
/// draws consumed per deviate varies; determinism still follows from the
/// seeded generator.
pub fn draw_standard_normal(rng: &mut StdRng) -> f64 {
    loop {
        let u = 2.0 * rng.random::<f64>() - 1.0;
        let v = 2.0 * rng.random::<f64>() - 1.0;
        let radius_sq = u * u + v * v;
        if radius_sq > 0.0 && radius_sq < 1.0 {
            return u * (-2.0 * radius_sq.ln() / radius_sq).sqrt();
        }
    }
}
