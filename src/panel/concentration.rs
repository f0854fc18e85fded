use std::collections::BTreeMap;

use rayon::prelude::*;
use tracing::info;

use super::profile::WalletProfiles;
use crate::config::PanelConfig;
use crate::types::{hour_grid, Hour, HourPanel, WalletClass, WalletHourRecord};

/// Herfindahl index of outflow shares. Zero when nothing flowed out.
pub fn hhi(outflows: impl IntoIterator<Item = f64>) -> f64 {
    let outflows: Vec<f64> = outflows.into_iter().filter(|o| *o > 0.0).collect();
    let total: f64 = outflows.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    outflows.iter().map(|o| (o / total).powi(2)).sum()
}

fn hour_panel(hour: Hour, records: &[&WalletHourRecord], profiles: &WalletProfiles) -> HourPanel {
    let mut panel = HourPanel {
        hour,
        ..HourPanel::default()
    };
    let mut classified = Vec::with_capacity(records.len());
    for record in records {
        let outflow = record.effective_outflow();
        panel.ust_inflow += record.ust_inflow;
        panel.ust_outflow += outflow;
        match profiles.classify(&record.wallet).map(|p| p.class()) {
            Ok(WalletClass::Whale) => {
                panel.whale_outflow += outflow;
                classified.push(outflow);
            }
            Ok(WalletClass::Small) => {
                panel.small_outflow += outflow;
                classified.push(outflow);
            }
            Err(_) => panel.unclassified_outflow += outflow,
        }
    }
    panel.net_outflow = panel.ust_outflow - panel.ust_inflow;
    let classified_total = panel.whale_outflow + panel.small_outflow;
    panel.top_share = if classified_total > 0.0 {
        panel.whale_outflow / classified_total
    } else {
        0.0
    };
    panel.hhi = hhi(classified);
    panel
}

/// Dense hourly aggregates over `[window_start, window_end]`, ordered by hour.
///
/// Whale status comes from the static profiles, never from within-hour ranking.
pub fn aggregate_hours(
    records: &[WalletHourRecord],
    profiles: &WalletProfiles,
    config: &PanelConfig,
) -> Vec<HourPanel> {
    let mut by_hour: BTreeMap<Hour, Vec<&WalletHourRecord>> = BTreeMap::new();
    for record in records
        .iter()
        .filter(|r| r.hour >= config.window_start && r.hour <= config.window_end)
    {
        by_hour.entry(record.hour).or_default().push(record);
    }

    let grid: Vec<Hour> = hour_grid(config.window_start, config.window_end).collect();
    let panels: Vec<HourPanel> = grid
        .par_iter()
        .map(|hour| {
            let records = by_hour.get(hour).map(Vec::as_slice).unwrap_or(&[]);
            hour_panel(*hour, records, profiles)
        })
        .collect();

    info!(
        hours = panels.len(),
        active_hours = by_hour.len(),
        unclassified_outflow = panels.iter().map(|p| p.unclassified_outflow).sum::<f64>(),
        "built hourly concentration panel"
    );
    panels
}
