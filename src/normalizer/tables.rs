//! Hourly tables handed over by the acquisition layer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::decode::validate_amount;
use super::stream::NormalizeStats;
use crate::config::PanelConfig;
use crate::types::{truncate_hour, Event, Hour, WalletId};

/// `deposits` table: `hour, wallet, ust_inflow`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositRow {
    pub hour: Hour,
    pub wallet: WalletId,
    pub ust_inflow: f64,
}

/// `redeems` table: `hour, wallet, ust_outflow, aust_sent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedeemRow {
    pub hour: Hour,
    pub wallet: WalletId,
    pub ust_outflow: f64,
    #[serde(default)]
    pub aust_sent: f64,
}

/// Wallet pre-window activity table: `wallet, tx_count, contract_count, active_days`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletActivityRow {
    pub wallet: WalletId,
    #[serde(default)]
    pub tx_count: u32,
    #[serde(default)]
    pub contract_count: u32,
    #[serde(default)]
    pub active_days: u32,
}

/// Price series: `hour, price`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    pub hour: Hour,
    pub price: f64,
}

/// Convert the hourly tables into events, validating amounts like raw records.
///
/// Offsets are assigned in table order, deposits first.
pub fn events_from_tables(
    deposits: &[DepositRow],
    redeems: &[RedeemRow],
    config: &PanelConfig,
) -> (Vec<Event>, NormalizeStats) {
    let mut stats = NormalizeStats::default();
    let mut events = Vec::with_capacity(deposits.len() + redeems.len());
    let mut offset = 0u64;

    let mut push = |event: Event, stats: &mut NormalizeStats| {
        if event.hour < config.history_start || event.hour > config.window_end {
            stats.out_of_window += 1;
        } else {
            stats.emitted += 1;
            events.push(event);
        }
    };

    for row in deposits {
        stats.processed += 1;
        offset += 1;
        match validate_amount(row.ust_inflow) {
            Ok(amount) => push(
                Event::deposit(row.wallet.clone(), row.hour, amount).with_offset(offset),
                &mut stats,
            ),
            Err(err) => stats.record_skip(offset, err),
        }
    }
    for row in redeems {
        stats.processed += 1;
        offset += 1;
        let checked = validate_amount(row.ust_outflow)
            .and_then(|outflow| validate_amount(row.aust_sent).map(|aust| (outflow, aust)));
        match checked {
            Ok((outflow, aust)) => push(
                Event::redeem(row.wallet.clone(), row.hour, outflow, aust).with_offset(offset),
                &mut stats,
            ),
            Err(err) => stats.record_skip(offset, err),
        }
    }
    (events, stats)
}

/// Hourly price lookup. Duplicate hours are averaged; non-positive prices dropped.
pub fn price_map(rows: &[PriceRow]) -> BTreeMap<Hour, f64> {
    let mut sums: BTreeMap<Hour, (f64, u32)> = BTreeMap::new();
    for row in rows {
        if !row.price.is_finite() || row.price <= 0.0 {
            continue;
        }
        let entry = sums.entry(truncate_hour(row.hour)).or_insert((0.0, 0));
        entry.0 += row.price;
        entry.1 += 1;
    }
    sums.into_iter()
        .map(|(hour, (sum, n))| (hour, sum / n as f64))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_tables_to_events() {
        let config = PanelConfig::default();
        let hour = Utc.with_ymd_and_hms(2022, 5, 8, 3, 0, 0).unwrap();
        let deposits = vec![
            DepositRow {
                hour,
                wallet: "terra1a".into(),
                ust_inflow: 10.0,
            },
            DepositRow {
                hour,
                wallet: "terra1b".into(),
                ust_inflow: f64::NAN,
            },
        ];
        let redeems = vec![RedeemRow {
            hour,
            wallet: "terra1a".into(),
            ust_outflow: 0.0,
            aust_sent: 4.0,
        }];
        let (events, stats) = events_from_tables(&deposits, &redeems, &config);
        assert_eq!(events.len(), 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.processed, 3);
        assert_eq!(events[1].aust_sent, 4.0);
        assert_eq!(events[1].offset, 3);
    }

    #[test]
    fn test_price_map_averages_and_truncates() {
        let h = Utc.with_ymd_and_hms(2022, 5, 9, 12, 0, 0).unwrap();
        let rows = vec![
            PriceRow {
                hour: h,
                price: 0.9,
            },
            PriceRow {
                hour: h + chrono::TimeDelta::minutes(30),
                price: 0.7,
            },
            PriceRow {
                hour: h,
                price: -1.0,
            },
        ];
        let map = price_map(&rows);
        assert_eq!(map.len(), 1);
        assert!((map[&h] - 0.8).abs() < 1e-12);
    }
}
