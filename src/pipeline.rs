//! End-to-end batch run: normalize, build panels, run each estimator.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::analysis::{
    estimate_losses, event_window, hazard_report, lag_regression, EventWindow, HazardReport,
    LagRegression, LossInputs, LossReport,
};
use crate::config::PanelConfig;
use crate::errors::{EstimationResult, MissingProfileError, PanelError, Result};
use crate::normalizer::{
    events_from_tables, price_map, DepositRow, EventStream, NormalizeStats, PriceRow, RawRecord,
    RedeemRow, WalletActivityRow,
};
use crate::output::{
    flows_hourly, wallet_hour, wallet_static, FlowsHourlyRow, WalletHourRow, WalletStaticRow,
};
use crate::panel::{aggregate_events, aggregate_hours, build_wallet_panel, WalletProfiles};
use crate::timings::time_block;
use crate::types::{Event, WalletId};

/// Where the events come from.
#[derive(Debug, Clone)]
pub enum EventSource {
    /// Raw indexer transactions, in offset order.
    Raw(Vec<RawRecord>),
    /// Hourly tables already extracted by the acquisition layer.
    Tables {
        deposits: Vec<DepositRow>,
        redeems: Vec<RedeemRow>,
    },
}

#[derive(Debug, Clone)]
pub struct PipelineInputs {
    pub source: EventSource,
    pub activity: Option<Vec<WalletActivityRow>>,
    pub prices: Vec<PriceRow>,
    pub reported_balances: Option<BTreeMap<WalletId, f64>>,
}

impl PipelineInputs {
    pub fn raw(records: Vec<RawRecord>) -> Self {
        Self::new(EventSource::Raw(records))
    }

    pub fn tables(deposits: Vec<DepositRow>, redeems: Vec<RedeemRow>) -> Self {
        Self::new(EventSource::Tables { deposits, redeems })
    }

    fn new(source: EventSource) -> Self {
        Self {
            source,
            activity: None,
            prices: Vec::new(),
            reported_balances: None,
        }
    }

    pub fn with_activity(mut self, activity: Vec<WalletActivityRow>) -> Self {
        self.activity = Some(activity);
        self
    }

    pub fn with_prices(mut self, prices: Vec<PriceRow>) -> Self {
        self.prices = prices;
        self
    }

    pub fn with_reported_balances(mut self, balances: BTreeMap<WalletId, f64>) -> Self {
        self.reported_balances = Some(balances);
        self
    }
}

#[derive(Debug, Clone)]
pub struct EventStudyReport {
    pub regression: EstimationResult<LagRegression>,
    pub window: EstimationResult<EventWindow>,
}

/// Everything one run produces. Estimator failures are kept per stage.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub normalize: NormalizeStats,
    pub flows_hourly: Vec<FlowsHourlyRow>,
    pub wallet_hour: Vec<WalletHourRow>,
    pub wallet_static: Vec<WalletStaticRow>,
    pub unclassified: Vec<MissingProfileError>,
    pub censoring_violations: usize,
    pub hazard: HazardReport,
    pub event_study: EventStudyReport,
    pub losses: EstimationResult<LossReport>,
}

fn stage_json<T: serde::Serialize>(result: &EstimationResult<T>) -> Result<Value> {
    Ok(match result {
        Ok(value) => serde_json::to_value(value)?,
        Err(err) => json!({ "error": err.to_string() }),
    })
}

impl RunReport {
    /// Summary of the estimator outputs, failed stages reported by message.
    pub fn summary_json(&self) -> Result<Value> {
        Ok(json!({
            "normalize": serde_json::to_value(&self.normalize)?,
            "hours": self.flows_hourly.len(),
            "wallet_hours": self.wallet_hour.len(),
            "wallets": self.wallet_static.len(),
            "unclassified": self.unclassified.iter().map(|e| e.wallet()).collect::<Vec<_>>(),
            "censoring_violations": self.censoring_violations,
            "hazard": {
                "cox": stage_json(&self.hazard.cox)?,
                "survival_curves": serde_json::to_value(&self.hazard.survival_curves)?,
            },
            "event_study": {
                "regression": stage_json(&self.event_study.regression)?,
                "window": stage_json(&self.event_study.window)?,
            },
            "losses": stage_json(&self.losses)?,
        }))
    }
}

fn normalize(
    source: EventSource,
    config: &PanelConfig,
) -> Result<(Vec<Event>, NormalizeStats)> {
    match source {
        EventSource::Raw(records) => EventStream::new(records, config).collect_events(),
        EventSource::Tables { deposits, redeems } => {
            let (events, stats) = events_from_tables(&deposits, &redeems, config);
            stats.check_skip_rate(config)?;
            Ok((events, stats))
        }
    }
}

/// Run every stage over one batch of inputs.
///
/// Fails only on run-level errors (invalid config, skip rate, empty panel);
/// estimator failures are carried in the report.
pub fn run(inputs: PipelineInputs, config: &PanelConfig) -> Result<RunReport> {
    config
        .validate()
        .map_err(|err| PanelError::InvalidConfig(format!("{err:#}")))?;
    let PipelineInputs {
        source,
        activity,
        prices,
        reported_balances,
    } = inputs;

    let (events, normalize_stats) = time_block("normalize", || normalize(source, config))?;
    info!(
        processed = normalize_stats.processed,
        emitted = normalize_stats.emitted,
        skipped = normalize_stats.skipped,
        ignored = normalize_stats.ignored,
        out_of_window = normalize_stats.out_of_window,
        "normalized events"
    );
    if events.is_empty() {
        return Err(PanelError::EmptyPanel);
    }

    let records = time_block("aggregate", || aggregate_events(&events));
    let profiles = time_block("profiles", || {
        WalletProfiles::build(&records, &events, activity.as_deref(), config)
    });
    let hours = time_block("concentration", || {
        aggregate_hours(&records, &profiles, config)
    });
    let panel = time_block("wallet_panel", || {
        build_wallet_panel(records, &profiles, config)
    });
    if !panel.unclassified.is_empty() {
        warn!(
            wallets = panel.unclassified.len(),
            "wallets with activity but no usable profile"
        );
    }

    let prices = price_map(&prices);
    let price_series = (!prices.is_empty()).then_some(&prices);

    let hazard = time_block("hazard", || hazard_report(&panel.exits, &profiles, config));
    let event_study = time_block("event_study", || EventStudyReport {
        regression: lag_regression(&hours, price_series, config),
        window: event_window(&hours, config),
    });
    let losses = time_block("losses", || {
        estimate_losses(
            &panel.exits,
            &panel.records,
            &profiles,
            LossInputs {
                prices: &prices,
                reported_balances: reported_balances.as_ref(),
            },
            config,
        )
    });

    for (stage, err) in [
        ("hazard", hazard.cox.as_ref().err()),
        ("lag_regression", event_study.regression.as_ref().err()),
        ("event_window", event_study.window.as_ref().err()),
        ("losses", losses.as_ref().err()),
    ] {
        if let Some(err) = err {
            warn!(stage, error = %err, "estimation stage failed");
        }
    }

    Ok(RunReport {
        normalize: normalize_stats,
        flows_hourly: flows_hourly(&hours),
        wallet_hour: wallet_hour(&panel, &profiles),
        wallet_static: wallet_static(&profiles),
        censoring_violations: panel.censoring_violations.len(),
        unclassified: panel.unclassified,
        hazard,
        event_study,
        losses,
    })
}
