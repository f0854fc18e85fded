use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use super::profile::WalletProfiles;
use crate::config::PanelConfig;
use crate::errors::{CensoringViolation, MissingProfileError};
use crate::types::{hour_grid, Event, Hour, WalletHourRecord, WalletId, WalletState};

/// Sum events into one record per `(wallet, hour)`, ordered by wallet then hour.
///
/// Wallets are independent partitions and are reduced in parallel.
pub fn aggregate_events(events: &[Event]) -> Vec<WalletHourRecord> {
    let mut by_wallet: BTreeMap<&WalletId, Vec<&Event>> = BTreeMap::new();
    for event in events {
        by_wallet.entry(&event.wallet).or_default().push(event);
    }
    let partitions: Vec<(&WalletId, Vec<&Event>)> = by_wallet.into_iter().collect();
    partitions
        .into_par_iter()
        .flat_map_iter(|(wallet, events)| {
            let mut hours: BTreeMap<Hour, WalletHourRecord> = BTreeMap::new();
            for event in events {
                hours
                    .entry(event.hour)
                    .or_insert_with(|| WalletHourRecord::new(wallet.clone(), event.hour))
                    .absorb(event);
            }
            hours.into_values()
        })
        .collect()
}

/// Exit outcome for one classified wallet.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WalletExit {
    pub wallet: WalletId,
    pub pre_run_balance: f64,
    /// First hour the threshold was reached; `None` means right-censored.
    pub exit_hour: Option<Hour>,
}

/// Wallet-level panel snapshot for the run.
#[derive(Clone, Debug, Default)]
pub struct WalletPanel {
    pub records: Vec<WalletHourRecord>,
    pub states: Vec<WalletState>,
    pub exits: Vec<WalletExit>,
    pub unclassified: Vec<MissingProfileError>,
    pub censoring_violations: Vec<CensoringViolation>,
}

impl WalletPanel {
    pub fn exit_for(&self, wallet: &WalletId) -> Option<&WalletExit> {
        self.exits
            .binary_search_by(|e| e.wallet.cmp(wallet))
            .ok()
            .map(|idx| &self.exits[idx])
    }
}

enum WalletOutcome {
    Classified(Vec<WalletState>, WalletExit),
    Unclassified(MissingProfileError),
    Violation(CensoringViolation),
}

/// Run-window net outflow per hour for one wallet, already ordered by hour.
fn run_window_flows(records: &[&WalletHourRecord], config: &PanelConfig) -> BTreeMap<Hour, f64> {
    records
        .iter()
        .filter(|r| r.hour >= config.run_start && r.hour <= config.run_end)
        .map(|r| (r.hour, r.net_outflow()))
        .collect()
}

/// Fold a wallet's run-window flows over a dense hourly grid.
///
/// Hours with no record contribute zero. The exit flag is sticky.
pub fn dense_states(
    wallet: &WalletId,
    flows: &BTreeMap<Hour, f64>,
    pre_run_balance: f64,
    threshold: f64,
) -> Vec<WalletState> {
    let (Some((&first, _)), Some((&last, _))) = (flows.first_key_value(), flows.last_key_value())
    else {
        return Vec::new();
    };
    let trigger = threshold * pre_run_balance;
    let mut cumulative = 0.0;
    let mut exited = false;
    hour_grid(first, last)
        .map(|hour| {
            let net = flows.get(&hour).copied().unwrap_or(0.0);
            cumulative += net;
            exited = exited || cumulative >= trigger;
            WalletState {
                wallet: wallet.clone(),
                hour,
                net_outflow: net,
                cumulative_net_outflow: cumulative,
                pre_run_balance,
                is_exit: exited,
            }
        })
        .collect()
}

fn wallet_outcome(
    wallet: &WalletId,
    records: &[&WalletHourRecord],
    profiles: &WalletProfiles,
    config: &PanelConfig,
) -> WalletOutcome {
    let profile = match profiles.classify(wallet) {
        Ok(profile) => profile,
        Err(err) => return WalletOutcome::Unclassified(err),
    };
    let flows = run_window_flows(records, config);
    let states = dense_states(
        wallet,
        &flows,
        profile.pre_run_balance,
        config.exit_threshold,
    );
    let exit_hour = states.iter().find(|s| s.is_exit).map(|s| s.hour);
    if let Some(hour) = exit_hour {
        if hour < config.run_start || hour > config.run_end {
            return WalletOutcome::Violation(CensoringViolation {
                wallet: wallet.to_string(),
                exit_hour: hour,
                window_start: config.run_start,
                window_end: config.run_end,
            });
        }
    }
    WalletOutcome::Classified(
        states,
        WalletExit {
            wallet: wallet.clone(),
            pre_run_balance: profile.pre_run_balance,
            exit_hour,
        },
    )
}

/// Build per-wallet running state and exit outcomes.
///
/// Every classified wallet gets an exit entry, including wallets with no activity
/// in the run window (censored). Wallets with activity but no usable profile are
/// reported as unclassified.
pub fn build_wallet_panel(
    records: Vec<WalletHourRecord>,
    profiles: &WalletProfiles,
    config: &PanelConfig,
) -> WalletPanel {
    let mut by_wallet: BTreeMap<&WalletId, Vec<&WalletHourRecord>> = BTreeMap::new();
    for record in &records {
        by_wallet.entry(&record.wallet).or_default().push(record);
    }
    for profile in profiles.classified() {
        by_wallet.entry(&profile.wallet).or_default();
    }

    let partitions: Vec<_> = by_wallet.into_iter().collect();
    let outcomes: Vec<WalletOutcome> = partitions
        .par_iter()
        .map(|(wallet, recs)| wallet_outcome(wallet, recs, profiles, config))
        .collect();

    let mut states = Vec::new();
    let mut exits = Vec::new();
    let mut unclassified = Vec::new();
    let mut censoring_violations = Vec::new();
    for outcome in outcomes {
        match outcome {
            WalletOutcome::Classified(wallet_states, exit) => {
                states.extend(wallet_states);
                exits.push(exit);
            }
            WalletOutcome::Unclassified(err) => unclassified.push(err),
            WalletOutcome::Violation(violation) => {
                warn!(error = %violation, "dropping wallet row");
                censoring_violations.push(violation);
            }
        }
    }

    info!(
        wallets = exits.len(),
        exited = exits.iter().filter(|e| e.exit_hour.is_some()).count(),
        unclassified = unclassified.len(),
        violations = censoring_violations.len(),
        "built wallet panel"
    );
    WalletPanel {
        records,
        states,
        exits,
        unclassified,
        censoring_violations,
    }
}
