//! Early-exit hazard: Cox proportional hazards and Kaplan–Meier curves.

use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::{debug, info};

use super::linalg::spd_inverse;
use crate::config::PanelConfig;
use crate::errors::{EstimationError, EstimationResult};
use crate::panel::{WalletExit, WalletProfiles};
use crate::stats_helpers::{mean, variance};
use crate::types::hours_between;

const STAGE: &str = "hazard";
const MIN_VARIANCE: f64 = 1e-10;
const MAX_HALVINGS: usize = 30;

/// One wallet's survival observation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SurvivalRecord {
    pub wallet: String,
    /// Hours from run start to exit, or the run length when censored.
    pub duration: f64,
    pub event: bool,
    pub pre_run_balance: f64,
    pub covariates: Vec<f64>,
}

pub const COVARIATE_NAMES: [&str; 3] = ["size_quantile", "log_tx_count", "log_active_days"];

/// Assemble survival records for every classified wallet.
pub fn survival_records(
    exits: &[WalletExit],
    profiles: &WalletProfiles,
    config: &PanelConfig,
) -> Vec<SurvivalRecord> {
    let censor_at = config.run_hours();
    exits
        .iter()
        .filter_map(|exit| {
            let profile = profiles.classify(&exit.wallet).ok()?;
            let (duration, event) = match exit.exit_hour {
                Some(hour) => (hours_between(config.run_start, hour) as f64, true),
                None => (censor_at, false),
            };
            Some(SurvivalRecord {
                wallet: exit.wallet.to_string(),
                duration,
                event,
                pre_run_balance: profile.pre_run_balance,
                covariates: vec![
                    f64::from(profile.size_quantile),
                    f64::from(profile.tx_count).ln_1p(),
                    f64::from(profile.active_days).ln_1p(),
                ],
            })
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CoxCoefficient {
    pub covariate: String,
    pub coef: f64,
    pub hazard_ratio: f64,
    pub std_error: f64,
    pub z: f64,
    pub p_value: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CoxFit {
    pub coefficients: Vec<CoxCoefficient>,
    pub dropped_covariates: Vec<String>,
    pub wallets: usize,
    pub events: usize,
    pub iterations: usize,
    pub log_likelihood: f64,
    pub penalizer: f64,
}

impl CoxFit {
    pub fn coefficient(&self, name: &str) -> Option<&CoxCoefficient> {
        self.coefficients.iter().find(|c| c.covariate == name)
    }
}

/// Penalized Breslow partial likelihood with its gradient and information matrix.
struct PartialLikelihood<'a> {
    x: &'a DMatrix<f64>,
    durations: &'a [f64],
    events: &'a [bool],
    /// Row indices ordered by descending duration.
    order: Vec<usize>,
    penalizer: f64,
}

impl<'a> PartialLikelihood<'a> {
    fn new(x: &'a DMatrix<f64>, durations: &'a [f64], events: &'a [bool], penalizer: f64) -> Self {
        let mut order: Vec<usize> = (0..durations.len()).collect();
        order.sort_by(|&a, &b| durations[b].total_cmp(&durations[a]));
        Self {
            x,
            durations,
            events,
            order,
            penalizer,
        }
    }

    fn evaluate(&self, beta: &DVector<f64>) -> (f64, DVector<f64>, DMatrix<f64>) {
        let p = beta.len();
        let eta = self.x * beta;
        let shift = eta.max();
        let mut s0 = 0.0;
        let mut s1 = DVector::<f64>::zeros(p);
        let mut s2 = DMatrix::<f64>::zeros(p, p);
        let mut loglik = 0.0;
        let mut grad = DVector::<f64>::zeros(p);
        let mut info = DMatrix::<f64>::zeros(p, p);

        let mut idx = 0;
        while idx < self.order.len() {
            let time = self.durations[self.order[idx]];
            let mut end = idx;
            while end < self.order.len() && self.durations[self.order[end]] == time {
                let row = self.order[end];
                let xi = self.x.row(row).transpose();
                let w = (eta[row] - shift).exp();
                s0 += w;
                s1 += &xi * w;
                s2 += &xi * xi.transpose() * w;
                end += 1;
            }
            let tied = &self.order[idx..end];
            let deaths = tied.iter().filter(|&&r| self.events[r]).count();
            if deaths > 0 {
                let d = deaths as f64;
                let mean_x = &s1 / s0;
                for &row in tied.iter().filter(|&&r| self.events[r]) {
                    loglik += eta[row];
                    grad += self.x.row(row).transpose() - &mean_x;
                }
                loglik -= d * (s0.ln() + shift);
                info += (&s2 / s0 - &mean_x * mean_x.transpose()) * d;
            }
            idx = end;
        }

        loglik -= 0.5 * self.penalizer * beta.norm_squared();
        grad -= beta * self.penalizer;
        info += DMatrix::<f64>::identity(p, p) * self.penalizer;
        (loglik, grad, info)
    }
}

/// Fit a Cox proportional-hazards model on standardized covariates.
///
/// Covariates without variance are dropped. Coefficients and standard errors are
/// reported on the original covariate scale.
pub fn fit_cox(records: &[SurvivalRecord], config: &PanelConfig) -> EstimationResult<CoxFit> {
    let wallets = records.len();
    let events = records.iter().filter(|r| r.event).count();
    if wallets < config.min_hazard_wallets {
        return Err(EstimationError::InsufficientSample {
            stage: STAGE,
            observations: wallets,
            required: config.min_hazard_wallets,
        });
    }
    if events == 0 {
        return Err(EstimationError::NoEvents { wallets });
    }

    let mut kept = Vec::new();
    let mut dropped = Vec::new();
    for (col, name) in COVARIATE_NAMES.iter().enumerate() {
        let column: Vec<f64> = records.iter().map(|r| r.covariates[col]).collect();
        let var = variance(&column);
        if var > MIN_VARIANCE {
            kept.push((col, *name, mean(&column).unwrap_or(0.0), var.sqrt()));
        } else {
            debug!(covariate = name, variance = var, "dropping constant covariate");
            dropped.push(name.to_string());
        }
    }
    if kept.is_empty() {
        return Err(EstimationError::DegenerateCovariates {
            stage: STAGE,
            dropped,
        });
    }

    let x = DMatrix::from_fn(wallets, kept.len(), |i, j| {
        let (col, _, m, sd) = kept[j];
        (records[i].covariates[col] - m) / sd
    });
    let durations: Vec<f64> = records.iter().map(|r| r.duration).collect();
    let flags: Vec<bool> = records.iter().map(|r| r.event).collect();
    let likelihood = PartialLikelihood::new(&x, &durations, &flags, config.hazard_penalizer);

    let mut beta = DVector::<f64>::zeros(kept.len());
    let (mut loglik, mut grad, mut info) = likelihood.evaluate(&beta);
    let mut last_step = f64::INFINITY;
    let mut iterations = 0;
    let parameters = kept.len();
    let singular = || EstimationError::Singular {
        stage: STAGE,
        observations: wallets,
        parameters,
    };

    while iterations < config.hazard_max_iter {
        iterations += 1;
        let step = spd_inverse(&info).ok_or_else(singular)? * &grad;
        let mut scale = 1.0;
        let mut accepted = None;
        for _ in 0..MAX_HALVINGS {
            let candidate = &beta + &step * scale;
            let evaluated = likelihood.evaluate(&candidate);
            if evaluated.0.is_finite() && evaluated.0 >= loglik - 1e-12 {
                accepted = Some((candidate, evaluated));
                break;
            }
            scale *= 0.5;
        }
        let Some((candidate, (next_ll, next_grad, next_info))) = accepted else {
            break;
        };
        last_step = (&step * scale).amax();
        let improvement = next_ll - loglik;
        beta = candidate;
        loglik = next_ll;
        grad = next_grad;
        info = next_info;
        if last_step < config.hazard_tolerance || improvement.abs() < config.hazard_tolerance {
            return finish(beta, &info, kept, dropped, wallets, events, iterations, loglik, config)
                .ok_or_else(singular);
        }
    }

    Err(EstimationError::DidNotConverge {
        iterations,
        wallets,
        events,
        last_step,
    })
}

#[allow(clippy::too_many_arguments)]
fn finish(
    beta: DVector<f64>,
    info: &DMatrix<f64>,
    kept: Vec<(usize, &str, f64, f64)>,
    dropped: Vec<String>,
    wallets: usize,
    events: usize,
    iterations: usize,
    log_likelihood: f64,
    config: &PanelConfig,
) -> Option<CoxFit> {
    let covariance = spd_inverse(info)?;
    let normal = Normal::new(0.0, 1.0).ok()?;
    let coefficients = kept
        .iter()
        .enumerate()
        .map(|(j, (_, name, _, sd))| {
            let coef = beta[j] / sd;
            let std_error = covariance[(j, j)].sqrt() / sd;
            let z = coef / std_error;
            CoxCoefficient {
                covariate: name.to_string(),
                coef,
                hazard_ratio: coef.exp(),
                std_error,
                z,
                p_value: 2.0 * (1.0 - normal.cdf(z.abs())),
            }
        })
        .collect();
    info!(wallets, events, iterations, log_likelihood, "fitted cox model");
    Some(CoxFit {
        coefficients,
        dropped_covariates: dropped,
        wallets,
        events,
        iterations,
        log_likelihood,
        penalizer: config.hazard_penalizer,
    })
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SurvivalPoint {
    pub duration: f64,
    pub at_risk: usize,
    pub events: usize,
    pub survival: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct KaplanMeierCurve {
    pub group: String,
    pub wallets: usize,
    pub events: usize,
    pub points: Vec<SurvivalPoint>,
}

/// Product-limit survival estimate.
pub fn kaplan_meier(group: impl Into<String>, records: &[&SurvivalRecord]) -> KaplanMeierCurve {
    let mut sorted: Vec<&SurvivalRecord> = records.to_vec();
    sorted.sort_by(|a, b| a.duration.total_cmp(&b.duration));
    let mut at_risk = sorted.len();
    let mut survival = 1.0;
    let mut points = Vec::new();
    let mut idx = 0;
    while idx < sorted.len() {
        let time = sorted[idx].duration;
        let tied = sorted[idx..]
            .iter()
            .take_while(|r| r.duration == time)
            .count();
        let deaths = sorted[idx..idx + tied].iter().filter(|r| r.event).count();
        if deaths > 0 {
            survival *= 1.0 - deaths as f64 / at_risk as f64;
            points.push(SurvivalPoint {
                duration: time,
                at_risk,
                events: deaths,
                survival,
            });
        }
        at_risk -= tied;
        idx += tied;
    }
    KaplanMeierCurve {
        group: group.into(),
        wallets: records.len(),
        events: records.iter().filter(|r| r.event).count(),
        points,
    }
}

/// Kaplan–Meier curves by pre-run balance quartile (`Q1` smallest).
pub fn kaplan_meier_by_quartile(records: &[SurvivalRecord]) -> Vec<KaplanMeierCurve> {
    let mut ranked: Vec<&SurvivalRecord> = records.iter().collect();
    ranked.sort_by(|a, b| {
        a.pre_run_balance
            .total_cmp(&b.pre_run_balance)
            .then_with(|| a.wallet.cmp(&b.wallet))
    });
    let n = ranked.len().max(1);
    let mut groups: [Vec<&SurvivalRecord>; 4] = Default::default();
    for (rank, record) in ranked.into_iter().enumerate() {
        groups[(rank * 4 / n).min(3)].push(record);
    }
    groups
        .iter()
        .enumerate()
        .filter(|(_, members)| !members.is_empty())
        .map(|(q, members)| kaplan_meier(format!("Q{}", q + 1), members))
        .collect()
}

/// Cox fit plus survival curves. The fit fails independently of the curves.
#[derive(Clone, Debug)]
pub struct HazardReport {
    pub cox: EstimationResult<CoxFit>,
    pub survival_curves: Vec<KaplanMeierCurve>,
    pub records: Vec<SurvivalRecord>,
}

pub fn hazard_report(
    exits: &[WalletExit],
    profiles: &WalletProfiles,
    config: &PanelConfig,
) -> HazardReport {
    let records = survival_records(exits, profiles, config);
    HazardReport {
        cox: fit_cox(&records, config),
        survival_curves: kaplan_meier_by_quartile(&records),
        records,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(wallet: usize, duration: f64, event: bool, size: f64, tx: f64) -> SurvivalRecord {
        SurvivalRecord {
            wallet: format!("terra1w{wallet:03}"),
            duration,
            event,
            pre_run_balance: 100.0 * (size + 1.0),
            covariates: vec![size, tx, 1.0],
        }
    }

    fn synthetic() -> Vec<SurvivalRecord> {
        // Larger size exits earlier; tx count is noise.
        (0..40)
            .map(|i| {
                let size = (i % 10) as f64;
                let duration = 10.0 + (10.0 - size) * 10.0 + (i % 3) as f64 * 7.0;
                let event = duration < 100.0;
                record(i, duration.min(100.0), event, size, ((i * 7) % 5) as f64)
            })
            .collect()
    }

    #[test]
    fn test_cox_size_effect_and_dropped_constant() {
        let config = PanelConfig::default();
        let fit = fit_cox(&synthetic(), &config).unwrap();
        assert_eq!(fit.dropped_covariates, vec!["log_active_days".to_string()]);
        let size = fit.coefficient("size_quantile").unwrap();
        assert!(size.coef > 0.0);
        assert!(size.hazard_ratio > 1.0);
        assert!(size.std_error > 0.0);
        assert!((0.0..=1.0).contains(&size.p_value));
    }

    #[test]
    fn test_cox_requires_events() {
        let config = PanelConfig::default();
        let records: Vec<_> = (0..10)
            .map(|i| record(i, 100.0, false, i as f64, 1.0))
            .collect();
        assert_eq!(
            fit_cox(&records, &config),
            Err(EstimationError::NoEvents { wallets: 10 })
        );
    }

    #[test]
    fn test_cox_all_constant_is_degenerate() {
        let config = PanelConfig::default();
        let records: Vec<_> = (0..10)
            .map(|i| record(i, i as f64, true, 1.0, 1.0))
            .collect();
        assert!(matches!(
            fit_cox(&records, &config),
            Err(EstimationError::DegenerateCovariates { .. })
        ));
    }

    #[test]
    fn test_kaplan_meier_steps() {
        let records = vec![
            record(0, 1.0, true, 0.0, 0.0),
            record(1, 2.0, false, 0.0, 0.0),
            record(2, 3.0, true, 0.0, 0.0),
            record(3, 3.0, true, 0.0, 0.0),
        ];
        let refs: Vec<_> = records.iter().collect();
        let curve = kaplan_meier("all", &refs);
        assert_eq!(curve.points.len(), 2);
        assert!((curve.points[0].survival - 0.75).abs() < 1e-12);
        assert_eq!(curve.points[1].at_risk, 2);
        assert_eq!(curve.points[1].survival, 0.0);
    }

    #[test]
    fn test_report_keeps_curves_when_fit_fails() {
        use crate::types::WalletStatic;

        let config = PanelConfig::default();
        let statics: Vec<WalletStatic> = (0..3)
            .map(|i| WalletStatic {
                wallet: format!("terra1w{i}").into(),
                pre_run_balance: 10.0 + i as f64,
                size_quantile: i,
                tx_count: i,
                contract_count: 1,
                active_days: i,
                is_whale: false,
            })
            .collect();
        let exits: Vec<WalletExit> = statics
            .iter()
            .map(|s| WalletExit {
                wallet: s.wallet.clone(),
                pre_run_balance: s.pre_run_balance,
                exit_hour: Some(config.run_start),
            })
            .collect();
        let profiles = WalletProfiles::from_statics(statics);
        let report = hazard_report(&exits, &profiles, &config);
        assert!(matches!(
            report.cox,
            Err(EstimationError::InsufficientSample { observations: 3, .. })
        ));
        assert_eq!(report.records.len(), 3);
        assert!(report.records.iter().all(|r| r.event && r.duration == 0.0));
        assert_eq!(
            report.survival_curves.iter().map(|c| c.wallets).sum::<usize>(),
            3
        );
    }

    #[test]
    fn test_quartiles_partition_wallets() {
        let curves = kaplan_meier_by_quartile(&synthetic());
        assert_eq!(curves.len(), 4);
        assert_eq!(curves.iter().map(|c| c.wallets).sum::<usize>(), 40);
        assert_eq!(curves[0].group, "Q1");
    }
}
