//! Realized and mark-to-market losses by exit timing and wallet class.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{BalanceSource, PanelConfig};
use crate::errors::{EstimationError, EstimationResult};
use crate::panel::{WalletExit, WalletProfiles};
use crate::stats_helpers::{quantile, Summary};
use crate::types::{hours_between, Hour, WalletClass, WalletHourRecord, WalletId};

const STAGE: &str = "losses";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ExitBucket {
    Early,
    Middle,
    Late,
    /// Never reached the exit threshold inside the run.
    Censored,
}

impl ExitBucket {
    pub const ALL: [ExitBucket; 4] = [
        ExitBucket::Early,
        ExitBucket::Middle,
        ExitBucket::Late,
        ExitBucket::Censored,
    ];
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WalletLoss {
    pub wallet: WalletId,
    pub class: WalletClass,
    pub bucket: ExitBucket,
    pub exit_hour: Option<Hour>,
    pub price: f64,
    pub loss_rate: f64,
    pub exposure: f64,
    pub loss_amount: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LossSummary {
    pub bucket: ExitBucket,
    pub class: Option<WalletClass>,
    pub loss_rate: Summary,
    pub total_loss: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LossReport {
    pub wallets: Vec<WalletLoss>,
    pub by_bucket: Vec<LossSummary>,
    pub by_bucket_class: Vec<LossSummary>,
    /// Exit-hour offsets (hours from run start) splitting the buckets.
    pub early_cutoff: Option<f64>,
    pub late_cutoff: Option<f64>,
    pub missing_price_wallets: usize,
    pub exposure_fallbacks: usize,
}

/// Inputs beyond the wallet panel.
#[derive(Clone, Copy, Debug)]
pub struct LossInputs<'a> {
    pub prices: &'a BTreeMap<Hour, f64>,
    /// Reported balances, read when the balance source is `Reported`.
    pub reported_balances: Option<&'a BTreeMap<WalletId, f64>>,
}

fn loss_rate(price: f64) -> f64 {
    (1.0 - price).clamp(0.0, 1.0)
}

/// Last known price at or before `hour`.
fn price_at(prices: &BTreeMap<Hour, f64>, hour: Hour) -> Option<f64> {
    prices.range(..=hour).next_back().map(|(_, p)| *p)
}

/// Outflow-weighted average price over the wallet's run-window outflow hours.
fn settlement_price(
    records: &[&WalletHourRecord],
    prices: &BTreeMap<Hour, f64>,
    config: &PanelConfig,
) -> Option<f64> {
    let (weighted, total) = records
        .iter()
        .filter(|r| r.hour >= config.run_start && r.hour <= config.run_end)
        .filter_map(|r| {
            let outflow = r.effective_outflow();
            let price = prices.get(&r.hour)?;
            (outflow > 0.0).then_some((outflow * price, outflow))
        })
        .fold((0.0, 0.0), |acc, (w, o)| (acc.0 + w, acc.1 + o));
    (total > 0.0).then(|| weighted / total)
}

fn bucket_for(offset: f64, early: f64, late: f64) -> ExitBucket {
    if offset <= early {
        ExitBucket::Early
    } else if offset >= late {
        ExitBucket::Late
    } else {
        ExitBucket::Middle
    }
}

fn summarize(
    losses: &[WalletLoss],
    bucket: ExitBucket,
    class: Option<WalletClass>,
) -> Option<LossSummary> {
    let members: Vec<&WalletLoss> = losses
        .iter()
        .filter(|l| l.bucket == bucket && class.map_or(true, |c| l.class == c))
        .collect();
    if members.is_empty() {
        return None;
    }
    let rates: Vec<f64> = members.iter().map(|l| l.loss_rate).collect();
    Some(LossSummary {
        bucket,
        class,
        loss_rate: Summary::of(&rates),
        total_loss: members.iter().map(|l| l.loss_amount).sum(),
    })
}

/// Per-wallet losses with bucket and class summaries.
///
/// Exiters settle at their outflow-weighted price (exit-hour price as fallback);
/// censored wallets are marked to market at the end of the run.
pub fn estimate_losses(
    exits: &[WalletExit],
    records: &[WalletHourRecord],
    profiles: &WalletProfiles,
    inputs: LossInputs<'_>,
    config: &PanelConfig,
) -> EstimationResult<LossReport> {
    if inputs.prices.is_empty() {
        return Err(EstimationError::MissingPrices {
            stage: STAGE,
            detail: "(empty price series)".to_string(),
        });
    }
    let end_price = price_at(inputs.prices, config.run_end).ok_or_else(|| {
        EstimationError::MissingPrices {
            stage: STAGE,
            detail: format!("at or before run end {}", config.run_end),
        }
    })?;

    let mut by_wallet: BTreeMap<&WalletId, Vec<&WalletHourRecord>> = BTreeMap::new();
    for record in records {
        by_wallet.entry(&record.wallet).or_default().push(record);
    }

    let offsets: Vec<f64> = exits
        .iter()
        .filter_map(|e| e.exit_hour)
        .map(|h| hours_between(config.run_start, h) as f64)
        .collect();
    let early_cutoff = quantile(&offsets, config.early_quantile);
    let late_cutoff = quantile(&offsets, config.late_quantile);

    let mut missing_price_wallets = 0;
    let mut exposure_fallbacks = 0;
    let mut wallets = Vec::with_capacity(exits.len());
    for exit in exits {
        let Ok(profile) = profiles.classify(&exit.wallet) else {
            continue;
        };
        let (price, bucket) = match exit.exit_hour {
            Some(hour) => {
                let own = by_wallet.get(&exit.wallet).map(Vec::as_slice).unwrap_or(&[]);
                let Some(price) = settlement_price(own, inputs.prices, config)
                    .or_else(|| price_at(inputs.prices, hour))
                else {
                    missing_price_wallets += 1;
                    continue;
                };
                let offset = hours_between(config.run_start, hour) as f64;
                let bucket = match (early_cutoff, late_cutoff) {
                    (Some(early), Some(late)) => bucket_for(offset, early, late),
                    _ => ExitBucket::Middle,
                };
                (price, bucket)
            }
            None => (end_price, ExitBucket::Censored),
        };

        let exposure = match config.balance_source {
            BalanceSource::Reconstructed => profile.pre_run_balance,
            BalanceSource::Reported => match inputs
                .reported_balances
                .and_then(|balances| balances.get(&exit.wallet))
            {
                Some(balance) => *balance,
                None => {
                    exposure_fallbacks += 1;
                    profile.pre_run_balance
                }
            },
        };
        let rate = loss_rate(price);
        wallets.push(WalletLoss {
            wallet: exit.wallet.clone(),
            class: profile.class(),
            bucket,
            exit_hour: exit.exit_hour,
            price,
            loss_rate: rate,
            exposure,
            loss_amount: rate * exposure,
        });
    }

    if missing_price_wallets > 0 {
        warn!(wallets = missing_price_wallets, "no settlement price for exited wallets");
    }
    if exposure_fallbacks > 0 {
        warn!(
            wallets = exposure_fallbacks,
            "reported balance missing, used reconstructed balance"
        );
    }

    let by_bucket = ExitBucket::ALL
        .iter()
        .filter_map(|&bucket| summarize(&wallets, bucket, None))
        .collect();
    let by_bucket_class = ExitBucket::ALL
        .iter()
        .flat_map(|&bucket| {
            [WalletClass::Whale, WalletClass::Small]
                .into_iter()
                .map(move |class| (bucket, class))
        })
        .filter_map(|(bucket, class)| summarize(&wallets, bucket, Some(class)))
        .collect();

    info!(
        wallets = wallets.len(),
        total_loss = wallets.iter().map(|l| l.loss_amount).sum::<f64>(),
        end_price,
        "estimated losses"
    );
    Ok(LossReport {
        wallets,
        by_bucket,
        by_bucket_class,
        early_cutoff,
        late_cutoff,
        missing_price_wallets,
        exposure_fallbacks,
    })
}
