//! Descriptive statistics helpers
//!
//! Small numeric utilities shared by the panel and analysis stages:
//! - Quantiles with linear interpolation (matches the usual dataframe default)
//! - Mean, sample standard deviation, median
//! - Distribution summaries for reporting

use serde::Serialize;

/// Linear-interpolated quantile of an ascending slice
///
/// # Arguments
/// * `sorted` - Values sorted ascending
/// * `q` - Quantile in [0, 1]
///
/// # Returns
/// `None` for an empty slice
pub fn quantile_sorted(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let q = q.clamp(0.0, 1.0);
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Quantile of unsorted values (copies and sorts)
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    sorted.sort_by(f64::total_cmp);
    quantile_sorted(&sorted, q)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (n - 1 denominator)
///
/// # Returns
/// `None` with fewer than two values
pub fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let ss = values.iter().map(|v| (v - m).powi(2)).sum::<f64>();
    Some((ss / (values.len() - 1) as f64).sqrt())
}

pub fn variance(values: &[f64]) -> f64 {
    sample_std(values).map(|s| s * s).unwrap_or(0.0)
}

/// Distribution summary used in loss and event-window reports
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Summary {
    pub count: usize,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub std: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Summary {
    pub fn of(values: &[f64]) -> Self {
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        Self {
            count: sorted.len(),
            mean: mean(&sorted),
            median: quantile_sorted(&sorted, 0.5),
            std: sample_std(&sorted),
            min: sorted.first().copied(),
            max: sorted.last().copied(),
        }
    }

    /// Standard error of the mean
    pub fn std_error(&self) -> Option<f64> {
        self.std.map(|s| s / (self.count as f64).sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantile_interpolates() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile(&values, 0.0), Some(1.0));
        assert_eq!(quantile(&values, 1.0), Some(4.0));
        assert!((quantile(&values, 0.5).unwrap() - 2.5).abs() < 1e-12);
        assert!((quantile(&values, 0.25).unwrap() - 1.75).abs() < 1e-12);
        assert_eq!(quantile(&[], 0.5), None);
    }

    #[test]
    fn test_summary() {
        let s = Summary::of(&[3.0, 1.0, 2.0]);
        assert_eq!(s.count, 3);
        assert_eq!(s.median, Some(2.0));
        assert_eq!(s.min, Some(1.0));
        assert_eq!(s.max, Some(3.0));
        assert!((s.std.unwrap() - 1.0).abs() < 1e-12);
        assert!((s.std_error().unwrap() - 1.0 / 3f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_sample_std_needs_two_values() {
        assert_eq!(sample_std(&[5.0]), None);
        assert_eq!(variance(&[5.0]), 0.0);
    }
}
