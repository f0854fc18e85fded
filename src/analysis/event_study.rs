//! Whale-led contagion: lagged regression of small-wallet outflow on whale outflow.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use statrs::distribution::{ChiSquared, ContinuousCDF, Normal};
use tracing::info;

use super::linalg::{ols, spd_inverse, OlsFit};
use crate::config::PanelConfig;
use crate::errors::{EstimationError, EstimationResult};
use crate::stats_helpers::{quantile, Summary};
use crate::types::{Hour, HourPanel};

const STAGE: &str = "event_study";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LagCoefficient {
    pub lag: usize,
    pub coef: f64,
    pub std_error: f64,
    pub t_stat: f64,
    pub p_value: f64,
}

/// Cumulative whale effect across all lags.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CombinedEffect {
    pub sum: f64,
    pub std_error: f64,
    pub z: f64,
    pub p_value: f64,
    /// Joint test that every lag coefficient is zero.
    pub wald_chi2: f64,
    pub wald_df: usize,
    pub wald_p_value: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LagRegression {
    pub lags: Vec<LagCoefficient>,
    pub intercept: f64,
    /// Coefficient on `1 - price`, when a price series was supplied.
    pub peg_deviation: Option<f64>,
    pub combined: CombinedEffect,
    pub observations: usize,
    pub excluded_hours: usize,
    pub missing_control_hours: usize,
    pub hac_lags: usize,
    pub r_squared: f64,
}

/// Design matrix for the lag regression.
#[derive(Clone, Debug)]
pub struct LagDesign {
    pub x: DMatrix<f64>,
    pub y: DVector<f64>,
    pub hours: Vec<Hour>,
    pub lags: Vec<usize>,
    pub has_control: bool,
    pub excluded_hours: usize,
    pub missing_control_hours: usize,
}

/// Build rows `t >= max(lag)` so no lag reaches before the first hour.
///
/// `hours` must be dense and ordered. Hours without a price are dropped when a
/// price series is given.
pub fn lag_design(
    hours: &[HourPanel],
    lags: &[usize],
    prices: Option<&BTreeMap<Hour, f64>>,
) -> LagDesign {
    let max_lag = lags.iter().copied().max().unwrap_or(0);
    let excluded_hours = max_lag.min(hours.len());
    let has_control = prices.is_some();
    let width = 1 + lags.len() + usize::from(has_control);

    let mut rows: Vec<f64> = Vec::new();
    let mut y = Vec::new();
    let mut kept_hours = Vec::new();
    let mut missing_control_hours = 0;
    for t in excluded_hours..hours.len() {
        let control = match prices {
            Some(prices) => match prices.get(&hours[t].hour) {
                Some(price) => Some(1.0 - price),
                None => {
                    missing_control_hours += 1;
                    continue;
                }
            },
            None => None,
        };
        rows.push(1.0);
        rows.extend(lags.iter().map(|&k| hours[t - k].whale_outflow));
        rows.extend(control);
        y.push(hours[t].small_outflow);
        kept_hours.push(hours[t].hour);
    }

    LagDesign {
        x: DMatrix::from_row_slice(y.len(), width, &rows),
        y: DVector::from_vec(y),
        hours: kept_hours,
        lags: lags.to_vec(),
        has_control,
        excluded_hours,
        missing_control_hours,
    }
}

fn combined_effect(
    fit: &OlsFit,
    covariance: &DMatrix<f64>,
    lag_count: usize,
) -> EstimationResult<CombinedEffect> {
    let beta_l = fit.beta.rows(1, lag_count).into_owned();
    let cov_l = covariance.view((1, 1), (lag_count, lag_count)).into_owned();

    let sum = beta_l.sum();
    let variance = cov_l.sum();
    let std_error = variance.max(0.0).sqrt();
    let z = if std_error > 0.0 { sum / std_error } else { 0.0 };

    let singular = || EstimationError::Singular {
        stage: STAGE,
        observations: fit.observations(),
        parameters: lag_count,
    };
    let cov_inv = spd_inverse(&cov_l).ok_or_else(singular)?;
    let wald_chi2 = (beta_l.transpose() * cov_inv * &beta_l)[(0, 0)];
    let normal = Normal::new(0.0, 1.0).map_err(|_| singular())?;
    let chi2 = ChiSquared::new(lag_count as f64).map_err(|_| singular())?;
    Ok(CombinedEffect {
        sum,
        std_error,
        z,
        p_value: 2.0 * (1.0 - normal.cdf(z.abs())),
        wald_chi2,
        wald_df: lag_count,
        wald_p_value: 1.0 - chi2.cdf(wald_chi2),
    })
}

/// Regress small outflow on lagged whale outflow with HAC standard errors.
pub fn lag_regression(
    hours: &[HourPanel],
    prices: Option<&BTreeMap<Hour, f64>>,
    config: &PanelConfig,
) -> EstimationResult<LagRegression> {
    let design = lag_design(hours, &config.lags, prices);
    if design.lags.is_empty() {
        return Err(EstimationError::InsufficientSample {
            stage: STAGE,
            observations: design.y.len(),
            required: 1,
        });
    }
    let fit = ols(&design.x, &design.y, STAGE)?;
    let hac_lags = config.hac_lags();
    let covariance = fit.hac_covariance(&design.x, hac_lags);
    let normal = Normal::new(0.0, 1.0).map_err(|_| EstimationError::Singular {
        stage: STAGE,
        observations: fit.observations(),
        parameters: fit.parameters(),
    })?;

    let lags = design
        .lags
        .iter()
        .enumerate()
        .map(|(i, &lag)| {
            let coef = fit.beta[1 + i];
            let std_error = covariance[(1 + i, 1 + i)].max(0.0).sqrt();
            let t_stat = if std_error > 0.0 { coef / std_error } else { 0.0 };
            LagCoefficient {
                lag,
                coef,
                std_error,
                t_stat,
                p_value: 2.0 * (1.0 - normal.cdf(t_stat.abs())),
            }
        })
        .collect();
    let combined = combined_effect(&fit, &covariance, design.lags.len())?;

    info!(
        observations = fit.observations(),
        excluded = design.excluded_hours,
        missing_control = design.missing_control_hours,
        cumulative = combined.sum,
        wald_p = combined.wald_p_value,
        "fitted lag regression"
    );
    Ok(LagRegression {
        lags,
        intercept: fit.beta[0],
        peg_deviation: design.has_control.then(|| fit.beta[fit.parameters() - 1]),
        combined,
        observations: fit.observations(),
        excluded_hours: design.excluded_hours,
        missing_control_hours: design.missing_control_hours,
        hac_lags,
        r_squared: fit.r_squared,
    })
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EventWindowPoint {
    pub offset: i64,
    pub count: usize,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub std_error: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EventWindow {
    pub threshold: f64,
    pub events: Vec<Hour>,
    pub points: Vec<EventWindowPoint>,
}

/// Small-wallet outflow around whale event hours.
///
/// Whale events are hours with positive whale outflow at or above the
/// `whale_event_quantile` of hourly whale outflow.
pub fn event_window(hours: &[HourPanel], config: &PanelConfig) -> EstimationResult<EventWindow> {
    let whale: Vec<f64> = hours.iter().map(|h| h.whale_outflow).collect();
    let threshold = quantile(&whale, config.whale_event_quantile).ok_or(
        EstimationError::InsufficientSample {
            stage: STAGE,
            observations: 0,
            required: 1,
        },
    )?;
    let event_idx: Vec<usize> = whale
        .iter()
        .enumerate()
        .filter(|(_, &w)| w > 0.0 && w >= threshold)
        .map(|(i, _)| i)
        .collect();
    if event_idx.is_empty() {
        return Err(EstimationError::InsufficientSample {
            stage: STAGE,
            observations: 0,
            required: 1,
        });
    }

    let n = hours.len() as i64;
    let points = (-config.event_window..=config.event_window)
        .map(|offset| {
            let values: Vec<f64> = event_idx
                .iter()
                .map(|&e| e as i64 + offset)
                .filter(|t| (0..n).contains(t))
                .map(|t| hours[t as usize].small_outflow)
                .collect();
            let summary = Summary::of(&values);
            EventWindowPoint {
                offset,
                count: summary.count,
                mean: summary.mean,
                std: summary.std,
                std_error: summary.std_error(),
            }
        })
        .collect();

    Ok(EventWindow {
        threshold,
        events: event_idx.iter().map(|&i| hours[i].hour).collect(),
        points,
    })
}
