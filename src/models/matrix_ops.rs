use faer::Mat;

/// Block-diagonal concatenation of two square matrices.
#[must_use]
pub fn matrix_diag_block(a: &Mat<f64>, b: &Mat<f64>) -> Mat<f64> {
    let n = a.nrows() + b.nrows();
    Mat::from_fn(n, n, |i, j| {
        if i < a.nrows() && j < a.ncols() {
            a[(i, j)]
        } else if i >= a.nrows() && j >= a.ncols() {
            b[(i - a.nrows(), j - a.ncols())]
        } else {
            0.0
        }
    })
}

/// AR(1) correlation matrix over unit integer lags, `R[i][j] = rho^|i - j|`.
#[must_use]
pub fn ar1_correlation(size: usize, rho: f64) -> Mat<f64> {
    Mat::from_fn(size, size, |i, j| {
        rho.powi(i32::try_from(i.abs_diff(j)).unwrap_or(i32::MAX))
    })
}

/// Closed-form tridiagonal inverse of the unit-lag AR(1) correlation matrix.
///
/// For `size == 1` the correlation degenerates to the identity and so does
/// its inverse.
#[must_use]
pub fn ar1_inverse(size: usize, rho: f64) -> Mat<f64> {
    if size == 1 {
        return Mat::from_fn(1, 1, |_, _| 1.0);
    }
    let scale = 1.0 / (1.0 - rho * rho);
    Mat::from_fn(size, size, |i, j| {
        if i == j {
            if i == 0 || i == size - 1 {
                scale
            } else {
                scale * (1.0 + rho * rho)
            }
        } else if i.abs_diff(j) == 1 {
            -rho * scale
        } else {
            0.0
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diag_block_keeps_off_diagonal_zero() {
        let a = Mat::from_fn(2, 2, |i, j| if i == j { 1.0 } else { 0.5 });
        let b = Mat::from_fn(1, 1, |_, _| 3.0);
        let block = matrix_diag_block(&a, &b);
        assert_eq!(block.nrows(), 3);
        assert!((block[(2, 2)] - 3.0).abs() < 1.0e-12);
        assert!((block[(0, 2)]).abs() < 1.0e-12);
        assert!((block[(2, 1)]).abs() < 1.0e-12);
    }

    #[test]
    fn ar1_inverse_round_trips_against_correlation() {
        for size in [1usize, 2, 3, 5, 8, 10] {
            for rho in [0.8, 0.9, 0.95, 0.995] {
                let correlation = ar1_correlation(size, rho);
                let inverse = ar1_inverse(size, rho);
                let product = &correlation * &inverse;
                for i in 0..size {
                    for j in 0..size {
                        let expected = if i == j { 1.0 } else { 0.0 };
                        assert!(
                            (product[(i, j)] - expected).abs() < 1.0e-8,
                            "size {size} rho {rho} entry ({i}, {j})"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn degenerate_block_uses_identity_correlation() {
        let correlation = ar1_correlation(1, 0.92);
        let inverse = ar1_inverse(1, 0.92);
        assert!((correlation[(0, 0)] - 1.0).abs() < 1.0e-12);
        assert!((inverse[(0, 0)] - 1.0).abs() < 1.0e-12);
    }
}
