use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

use crate::config::PanelConfig;
use crate::errors::MissingProfileError;
use crate::normalizer::WalletActivityRow;
use crate::stats_helpers::quantile_sorted;
use crate::types::{Event, FlowType, WalletHourRecord, WalletId, WalletStatic};

/// Pre-window activity counts for one wallet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Activity {
    pub tx_count: u32,
    pub contract_count: u32,
    pub active_days: u32,
}

impl From<&WalletActivityRow> for Activity {
    fn from(row: &WalletActivityRow) -> Self {
        Self {
            tx_count: row.tx_count,
            contract_count: row.contract_count,
            active_days: row.active_days,
        }
    }
}

/// Derive activity from events in `[history_start, run_start)`.
///
/// Every event is one transaction. Deposits touch the market contract and
/// redeems the aUST contract.
pub fn activity_from_events(
    events: &[Event],
    config: &PanelConfig,
) -> BTreeMap<WalletId, Activity> {
    #[derive(Default)]
    struct Seen {
        tx_count: u32,
        contracts: BTreeSet<FlowType>,
        days: BTreeSet<NaiveDate>,
    }

    let mut seen: BTreeMap<&WalletId, Seen> = BTreeMap::new();
    for event in events
        .iter()
        .filter(|e| e.hour >= config.history_start && e.hour < config.run_start)
    {
        let entry = seen.entry(&event.wallet).or_default();
        entry.tx_count += 1;
        entry.contracts.insert(event.flow_type);
        entry.days.insert(event.hour.date_naive());
    }
    seen
        .into_iter()
        .map(|(wallet, seen)| {
            (
                wallet.clone(),
                Activity {
                    tx_count: seen.tx_count,
                    contract_count: seen.contracts.len() as u32,
                    active_days: seen.days.len() as u32,
                },
            )
        })
        .collect()
}

/// Static wallet snapshot built once from pre-run history.
#[derive(Clone, Debug, Default)]
pub struct WalletProfiles {
    statics: BTreeMap<WalletId, WalletStatic>,
    whale_cutoff: Option<f64>,
}

impl WalletProfiles {
    /// Build profiles from the wallet-hour table.
    ///
    /// `activity` takes precedence over activity derived from the events.
    pub fn build(
        records: &[WalletHourRecord],
        events: &[Event],
        activity: Option<&[WalletActivityRow]>,
        config: &PanelConfig,
    ) -> Self {
        let mut net_inflow: BTreeMap<WalletId, f64> = BTreeMap::new();
        for record in records.iter().filter(|r| r.hour < config.run_start) {
            *net_inflow.entry(record.wallet.clone()).or_default() -= record.net_outflow();
        }
        let balances: BTreeMap<WalletId, f64> = net_inflow
            .into_iter()
            .map(|(wallet, net)| (wallet, net.max(0.0)))
            .collect();

        let activity: BTreeMap<WalletId, Activity> = match activity {
            Some(rows) => rows
                .iter()
                .map(|row| (row.wallet.clone(), Activity::from(row)))
                .collect(),
            None => activity_from_events(events, config),
        };

        let quantiles = size_quantiles(&balances, config.size_quantiles);
        let whale_cutoff = whale_cutoff(balances.values().copied(), config.whale_top_pct);

        let statics: BTreeMap<WalletId, WalletStatic> = balances
            .iter()
            .map(|(wallet, &balance)| {
                let act = activity.get(wallet).copied().unwrap_or_default();
                let is_whale =
                    balance > 0.0 && whale_cutoff.is_some_and(|cutoff| balance >= cutoff);
                let profile = WalletStatic {
                    wallet: wallet.clone(),
                    pre_run_balance: balance,
                    size_quantile: quantiles.get(wallet).copied().unwrap_or(0),
                    tx_count: act.tx_count,
                    contract_count: act.contract_count,
                    active_days: act.active_days,
                    is_whale,
                };
                (wallet.clone(), profile)
            })
            .collect();

        let whales = statics.values().filter(|s| s.is_whale).count();
        info!(
            wallets = statics.len(),
            whales,
            cutoff = whale_cutoff.unwrap_or(0.0),
            "built wallet profiles"
        );
        Self {
            statics,
            whale_cutoff,
        }
    }

    pub fn from_statics(statics: impl IntoIterator<Item = WalletStatic>) -> Self {
        let statics: BTreeMap<_, _> = statics
            .into_iter()
            .map(|s| (s.wallet.clone(), s))
            .collect();
        Self {
            statics,
            whale_cutoff: None,
        }
    }

    pub fn get(&self, wallet: &WalletId) -> Option<&WalletStatic> {
        self.statics.get(wallet)
    }

    /// Profile usable for class-dependent work, or why it is not.
    pub fn classify(&self, wallet: &WalletId) -> Result<&WalletStatic, MissingProfileError> {
        match self.statics.get(wallet) {
            None => Err(MissingProfileError::NoProfile(wallet.to_string())),
            Some(profile) if !profile.is_classified() => {
                Err(MissingProfileError::NonPositiveBalance {
                    wallet: wallet.to_string(),
                    balance: profile.pre_run_balance,
                })
            }
            Some(profile) => Ok(profile),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &WalletStatic> {
        self.statics.values()
    }

    pub fn classified(&self) -> impl Iterator<Item = &WalletStatic> {
        self.statics.values().filter(|s| s.is_classified())
    }

    pub fn len(&self) -> usize {
        self.statics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statics.is_empty()
    }

    pub fn whale_cutoff(&self) -> Option<f64> {
        self.whale_cutoff
    }
}

/// Equal-frequency bins of the balance rank, ties broken by wallet id.
fn size_quantiles(balances: &BTreeMap<WalletId, f64>, bins: u32) -> BTreeMap<WalletId, u32> {
    let mut ranked: Vec<(&WalletId, f64)> = balances.iter().map(|(w, &b)| (w, b)).collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
    let n = ranked.len() as u64;
    ranked
        .into_iter()
        .enumerate()
        .map(|(rank, (wallet, _))| {
            let bin = (rank as u64 * u64::from(bins) / n.max(1)) as u32;
            (wallet.clone(), bin.min(bins - 1))
        })
        .collect()
}

/// Balance at the `1 - top_pct` quantile of strictly positive balances.
pub fn whale_cutoff(balances: impl Iterator<Item = f64>, top_pct: f64) -> Option<f64> {
    let mut positive: Vec<f64> = balances.filter(|b| *b > 0.0).collect();
    positive.sort_by(f64::total_cmp);
    quantile_sorted(&positive, 1.0 - top_pct)
}
