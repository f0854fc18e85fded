//! Least-squares helpers on `nalgebra` dynamic matrices.

use nalgebra::{DMatrix, DVector};

use crate::errors::{EstimationError, EstimationResult};

/// Inverse of a symmetric positive-definite matrix via Cholesky.
pub fn spd_inverse(m: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    m.clone().cholesky().map(|c| c.inverse())
}

/// Ordinary least squares fit.
#[derive(Clone, Debug)]
pub struct OlsFit {
    pub beta: DVector<f64>,
    pub residuals: DVector<f64>,
    pub xtx_inv: DMatrix<f64>,
    pub r_squared: f64,
}

impl OlsFit {
    pub fn observations(&self) -> usize {
        self.residuals.len()
    }

    pub fn parameters(&self) -> usize {
        self.beta.len()
    }

    /// Homoskedastic covariance `s² (X'X)⁻¹`.
    pub fn classic_covariance(&self) -> DMatrix<f64> {
        let dof = (self.observations() - self.parameters()).max(1) as f64;
        let s2 = self.residuals.norm_squared() / dof;
        &self.xtx_inv * s2
    }

    /// Newey–West covariance with a Bartlett kernel over `max_lags` lags.
    ///
    /// Scaled by `n / (n - k)` for small samples.
    pub fn hac_covariance(&self, x: &DMatrix<f64>, max_lags: usize) -> DMatrix<f64> {
        let n = self.observations();
        let k = self.parameters();
        // Score rows u_t * x_t.
        let mut scores = x.clone();
        for (t, mut row) in scores.row_iter_mut().enumerate() {
            row *= self.residuals[t];
        }
        let mut meat = scores.transpose() * &scores;
        for lag in 1..=max_lags.min(n.saturating_sub(1)) {
            let weight = 1.0 - lag as f64 / (max_lags as f64 + 1.0);
            let lead = scores.rows(lag, n - lag);
            let lagged = scores.rows(0, n - lag);
            let gamma = lead.transpose() * lagged;
            meat += (&gamma + gamma.transpose()) * weight;
        }
        let correction = n as f64 / (n.saturating_sub(k)).max(1) as f64;
        &self.xtx_inv * meat * &self.xtx_inv * correction
    }
}

/// Fit `y = X β + u` by the normal equations.
pub fn ols(x: &DMatrix<f64>, y: &DVector<f64>, stage: &'static str) -> EstimationResult<OlsFit> {
    let (n, k) = x.shape();
    if n <= k {
        return Err(EstimationError::InsufficientSample {
            stage,
            observations: n,
            required: k + 1,
        });
    }
    let xt = x.transpose();
    let xtx_inv = spd_inverse(&(&xt * x)).ok_or(EstimationError::Singular {
        stage,
        observations: n,
        parameters: k,
    })?;
    let beta = &xtx_inv * (&xt * y);
    let residuals = y - x * &beta;
    let y_mean = y.mean();
    let tss: f64 = y.iter().map(|v| (v - y_mean).powi(2)).sum();
    let r_squared = if tss > 0.0 {
        1.0 - residuals.norm_squared() / tss
    } else {
        0.0
    };
    Ok(OlsFit {
        beta,
        residuals,
        xtx_inv,
        r_squared,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ols_recovers_exact_line() {
        let xs: Vec<f64> = (0..10).map(f64::from).collect();
        let x = DMatrix::from_fn(10, 2, |i, j| if j == 0 { 1.0 } else { xs[i] });
        let y = DVector::from_iterator(10, xs.iter().map(|v| 3.0 + 2.0 * v));
        let fit = ols(&x, &y, "test").unwrap();
        assert!((fit.beta[0] - 3.0).abs() < 1e-9);
        assert!((fit.beta[1] - 2.0).abs() < 1e-9);
        assert!((fit.r_squared - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_collinear_design_is_singular() {
        let x = DMatrix::from_fn(6, 2, |i, _| i as f64);
        let y = DVector::from_element(6, 1.0);
        assert!(matches!(
            ols(&x, &y, "test"),
            Err(EstimationError::Singular { .. })
        ));
    }

    #[test]
    fn test_hac_with_zero_lags_is_white() {
        let x = DMatrix::from_fn(8, 2, |i, j| if j == 0 { 1.0 } else { (i * i) as f64 });
        let y = DVector::from_iterator(8, (0..8).map(|i| ((i * 7) % 5) as f64));
        let fit = ols(&x, &y, "test").unwrap();
        let hac = fit.hac_covariance(&x, 0);
        assert!(hac[(0, 0)] > 0.0 && hac[(1, 1)] > 0.0);
        assert!((hac[(0, 1)] - hac[(1, 0)]).abs() < 1e-9);
    }
}
