//! Output tables with their exact column names.

use serde::{Deserialize, Serialize};

use crate::panel::{WalletPanel, WalletProfiles};
use crate::types::{Hour, HourPanel, WalletId};

/// `flows_hourly` row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowsHourlyRow {
    pub hour: Hour,
    pub ust_inflow: f64,
    pub ust_outflow: f64,
    pub net_outflow: f64,
    pub whale_outflow: f64,
    pub small_outflow: f64,
    pub top_share: f64,
    pub hhi: f64,
}

impl From<&HourPanel> for FlowsHourlyRow {
    fn from(panel: &HourPanel) -> Self {
        Self {
            hour: panel.hour,
            ust_inflow: panel.ust_inflow,
            ust_outflow: panel.ust_outflow,
            net_outflow: panel.net_outflow,
            whale_outflow: panel.whale_outflow,
            small_outflow: panel.small_outflow,
            top_share: panel.top_share,
            hhi: panel.hhi,
        }
    }
}

/// `wallet_hour` row. `is_exit` is set from the wallet's exit hour onwards,
/// including rows after the run window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalletHourRow {
    pub wallet: WalletId,
    pub hour: Hour,
    pub ust_inflow: f64,
    pub ust_outflow: f64,
    pub net_outflow: f64,
    pub pre_run_balance: Option<f64>,
    pub is_exit: bool,
}

/// `wallet_static` row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalletStaticRow {
    pub wallet: WalletId,
    pub pre_run_balance: f64,
    pub size_quantile: u32,
    pub tx_count: u32,
    pub active_days: u32,
}

pub fn flows_hourly(hours: &[HourPanel]) -> Vec<FlowsHourlyRow> {
    hours.iter().map(FlowsHourlyRow::from).collect()
}

/// One row per observed `(wallet, hour)` record, ordered by wallet then hour.
pub fn wallet_hour(panel: &WalletPanel, profiles: &WalletProfiles) -> Vec<WalletHourRow> {
    panel
        .records
        .iter()
        .map(|record| {
            let exit_hour = panel
                .exit_for(&record.wallet)
                .and_then(|exit| exit.exit_hour);
            WalletHourRow {
                wallet: record.wallet.clone(),
                hour: record.hour,
                ust_inflow: record.ust_inflow,
                ust_outflow: record.effective_outflow(),
                net_outflow: record.net_outflow(),
                pre_run_balance: profiles.get(&record.wallet).map(|p| p.pre_run_balance),
                is_exit: exit_hour.is_some_and(|hour| hour <= record.hour),
            }
        })
        .collect()
}

pub fn wallet_static(profiles: &WalletProfiles) -> Vec<WalletStaticRow> {
    profiles
        .iter()
        .map(|p| WalletStaticRow {
            wallet: p.wallet.clone(),
            pre_run_balance: p.pre_run_balance,
            size_quantile: p.size_quantile,
            tx_count: p.tx_count,
            active_days: p.active_days,
        })
        .collect()
}
