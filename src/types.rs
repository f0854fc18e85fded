use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Identifier for a wallet (bech32 account address).
#[repr(transparent)]
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletId(pub String);

impl WalletId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl From<&str> for WalletId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for WalletId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// UTC hour bucket. Always truncated to the top of the hour.
pub type Hour = DateTime<Utc>;

const SECONDS_PER_HOUR: i64 = 3600;

/// Floor a timestamp to the start of its hour.
pub fn truncate_hour(ts: DateTime<Utc>) -> Hour {
    let secs = ts.timestamp();
    let floored = secs - secs.rem_euclid(SECONDS_PER_HOUR);
    DateTime::from_timestamp(floored, 0).unwrap_or(ts)
}

/// Inclusive hourly grid `[start, end]`. Empty when `end < start`.
pub fn hour_grid(start: Hour, end: Hour) -> impl Iterator<Item = Hour> {
    let start = truncate_hour(start);
    let end = truncate_hour(end);
    let steps = if end < start {
        0
    } else {
        hours_between(start, end) + 1
    };
    (0..steps).map(move |i| start + TimeDelta::hours(i))
}

/// Whole hours from `start` to `end` (negative when `end` precedes `start`).
pub fn hours_between(start: Hour, end: Hour) -> i64 {
    (end - start).num_hours()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    Deposit,
    Redeem,
}

/// Canonical normalized flow. `amount` is unsigned; direction lives in `flow_type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub wallet: WalletId,
    pub hour: Hour,
    pub flow_type: FlowType,
    /// UST amount, already scaled from micro-units.
    pub amount: f64,
    /// aUST sent with a redeem; zero for deposits.
    #[serde(default)]
    pub aust_sent: f64,
    /// Source offset the event was read from.
    #[serde(default)]
    pub offset: u64,
}

impl Event {
    pub fn deposit(wallet: impl Into<WalletId>, hour: Hour, amount: f64) -> Self {
        Self {
            wallet: wallet.into(),
            hour: truncate_hour(hour),
            flow_type: FlowType::Deposit,
            amount,
            aust_sent: 0.0,
            offset: 0,
        }
    }

    pub fn redeem(wallet: impl Into<WalletId>, hour: Hour, amount: f64, aust_sent: f64) -> Self {
        Self {
            wallet: wallet.into(),
            hour: truncate_hour(hour),
            flow_type: FlowType::Redeem,
            amount,
            aust_sent,
            offset: 0,
        }
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }
}

/// One row per `(wallet, hour)` with at least one event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WalletHourRecord {
    pub wallet: WalletId,
    pub hour: Hour,
    pub ust_inflow: f64,
    pub ust_outflow: f64,
    pub aust_sent: f64,
    /// aUST sent by redeems that carried no settled UST amount.
    #[serde(default)]
    pub unsettled_aust: f64,
}

impl WalletHourRecord {
    pub fn new(wallet: WalletId, hour: Hour) -> Self {
        Self {
            wallet,
            hour,
            ..Self::default()
        }
    }

    pub fn absorb(&mut self, event: &Event) {
        match event.flow_type {
            FlowType::Deposit => self.ust_inflow += event.amount,
            FlowType::Redeem => {
                self.ust_outflow += event.amount;
                self.aust_sent += event.aust_sent;
                if event.amount <= 0.0 {
                    self.unsettled_aust += event.aust_sent;
                }
            }
        }
    }

    /// Outflow used downstream. Each redeem contributes its settled UST, or its
    /// aUST amount when nothing was settled.
    pub fn effective_outflow(&self) -> f64 {
        self.ust_outflow + self.unsettled_aust
    }

    pub fn net_outflow(&self) -> f64 {
        self.effective_outflow() - self.ust_inflow
    }
}

/// Dense per-wallet running state inside the run window.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WalletState {
    pub wallet: WalletId,
    pub hour: Hour,
    pub net_outflow: f64,
    pub cumulative_net_outflow: f64,
    pub pre_run_balance: f64,
    pub is_exit: bool,
}

/// Pre-window snapshot of a wallet. Immutable for the run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalletStatic {
    pub wallet: WalletId,
    pub pre_run_balance: f64,
    pub size_quantile: u32,
    pub tx_count: u32,
    pub contract_count: u32,
    pub active_days: u32,
    pub is_whale: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletClass {
    Whale,
    Small,
}

impl WalletStatic {
    pub fn class(&self) -> WalletClass {
        if self.is_whale {
            WalletClass::Whale
        } else {
            WalletClass::Small
        }
    }

    pub fn is_classified(&self) -> bool {
        self.pre_run_balance > 0.0
    }
}

/// Hour-level aggregate across all wallets.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HourPanel {
    pub hour: Hour,
    pub ust_inflow: f64,
    pub ust_outflow: f64,
    pub net_outflow: f64,
    pub whale_outflow: f64,
    pub small_outflow: f64,
    pub unclassified_outflow: f64,
    pub top_share: f64,
    pub hhi: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_truncate_hour() {
        let ts = Utc.with_ymd_and_hms(2022, 5, 9, 13, 47, 12).unwrap();
        assert_eq!(
            truncate_hour(ts),
            Utc.with_ymd_and_hms(2022, 5, 9, 13, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_hour_grid_inclusive() {
        let start = Utc.with_ymd_and_hms(2022, 5, 9, 22, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2022, 5, 10, 1, 0, 0).unwrap();
        let grid: Vec<_> = hour_grid(start, end).collect();
        assert_eq!(grid.len(), 4);
        assert_eq!(grid[0], start);
        assert_eq!(grid[3], end);
        assert_eq!(hour_grid(end, start).count(), 0);
    }

    #[test]
    fn test_effective_outflow_uses_aust_proxy() {
        let hour = Utc.with_ymd_and_hms(2022, 5, 9, 0, 0, 0).unwrap();
        let mut record = WalletHourRecord::new(WalletId::from("terra1a"), hour);
        record.absorb(&Event::redeem("terra1a", hour, 0.0, 80.0));
        assert_eq!(record.effective_outflow(), 80.0);
        record.absorb(&Event::redeem("terra1a", hour, 95.0, 80.0));
        assert_eq!(record.effective_outflow(), 175.0);
        record.absorb(&Event::deposit("terra1a", hour, 15.0));
        assert_eq!(record.net_outflow(), 160.0);
        assert_eq!(record.aust_sent, 160.0);
    }

    #[test]
    fn test_settled_redeem_keeps_unsettled_neighbour() {
        let hour = Utc.with_ymd_and_hms(2022, 5, 9, 0, 0, 0).unwrap();
        let mut record = WalletHourRecord::new(WalletId::from("terra1a"), hour);
        record.absorb(&Event::redeem("terra1a", hour, 100.0, 80.0));
        record.absorb(&Event::redeem(
            "terra1a",
            hour + TimeDelta::minutes(5),
            0.0,
            50.0,
        ));
        assert_eq!(record.effective_outflow(), 150.0);
        assert_eq!(record.unsettled_aust, 50.0);
    }
}
