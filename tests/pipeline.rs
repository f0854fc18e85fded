use chrono::{TimeDelta, TimeZone, Utc};
use runpanel::normalizer::{DepositRow, PriceRow, RedeemRow};
use runpanel::{run, Hour, PanelConfig, PanelError, PipelineInputs, RawRecord, WalletId};

fn wallet(i: usize) -> WalletId {
    WalletId::new(format!("terra1wallet{i:02}"))
}

fn whale_amount(h: i64) -> f64 {
    5.0 + ((h * 37) % 11) as f64 * 3.0
}

fn scenario(config: &PanelConfig) -> PipelineInputs {
    let history = Utc.with_ymd_and_hms(2022, 4, 10, 0, 0, 0).unwrap();
    let at = |h: i64| -> Hour { config.run_start + TimeDelta::hours(h) };

    let deposits: Vec<DepositRow> = (0..30)
        .map(|i| DepositRow {
            hour: history + TimeDelta::hours(i as i64),
            wallet: wallet(i),
            ust_inflow: 100.0 * (i + 1) as f64,
        })
        .collect();

    let mut redeems = Vec::new();
    for i in (0..30).step_by(2) {
        redeems.push(RedeemRow {
            hour: at(i as i64 + 1),
            wallet: wallet(i),
            ust_outflow: 60.0 * (i + 1) as f64,
            aust_sent: 0.0,
        });
    }
    for h in 0..200 {
        redeems.push(RedeemRow {
            hour: at(h),
            wallet: wallet(29),
            ust_outflow: whale_amount(h),
            aust_sent: 0.0,
        });
        let lagged = if h > 0 { whale_amount(h - 1) } else { 0.0 };
        redeems.push(RedeemRow {
            hour: at(h),
            wallet: wallet(2 * (h as usize % 10) + 1),
            ust_outflow: 0.0,
            // No settled amount: the aUST sent stands in for the outflow.
            aust_sent: 1.0 + ((h * 13) % 7) as f64 + 0.3 * lagged,
        });
    }

    // Trailing activity after the run window closes.
    redeems.push(RedeemRow {
        hour: config.run_end + TimeDelta::hours(24),
        wallet: wallet(29),
        ust_outflow: 50.0,
        aust_sent: 0.0,
    });

    let prices = (0..=config.run_hours() as i64)
        .map(|h| PriceRow {
            hour: at(h),
            price: (1.0 - 0.004 * h as f64).max(0.05),
        })
        .collect();

    PipelineInputs::tables(deposits, redeems).with_prices(prices)
}

fn config() -> PanelConfig {
    PanelConfig {
        whale_top_pct: 0.1,
        ..PanelConfig::default()
    }
}

#[test]
fn test_full_run_over_tables() {
    let config = config();
    let report = run(scenario(&config), &config).unwrap();

    let window_hours = (config.window_end - config.window_start).num_hours() as usize + 1;
    assert_eq!(report.flows_hourly.len(), window_hours);
    assert_eq!(report.wallet_static.len(), 30);
    assert!(report.unclassified.is_empty());
    assert_eq!(report.normalize.skipped, 0);

    for row in &report.flows_hourly {
        assert!((0.0..=1.0 + 1e-12).contains(&row.hhi));
        assert!((0.0..=1.0 + 1e-12).contains(&row.top_share));
        if row.ust_outflow == 0.0 {
            assert_eq!(row.hhi, 0.0);
        }
    }

    // Exit flags never switch back off within a wallet, including after run_end.
    let mut last: Option<(&WalletId, bool)> = None;
    for row in &report.wallet_hour {
        if let Some((w, was_exit)) = last {
            if w == &row.wallet && was_exit {
                assert!(row.is_exit, "{} re-entered at {}", row.wallet, row.hour);
            }
        }
        last = Some((&row.wallet, row.is_exit));
    }
    assert!(report
        .wallet_hour
        .iter()
        .any(|r| r.hour > config.run_end && r.is_exit));
    assert!(report.wallet_hour.iter().any(|r| r.is_exit));
    assert!(report
        .wallet_hour
        .iter()
        .all(|r| r.hour >= config.run_start || !r.is_exit));

    assert_eq!(report.hazard.records.len(), 30);
    let cox = report.hazard.cox.as_ref().unwrap();
    assert!(cox.events > 0);
    assert!(cox.coefficient("size_quantile").is_some());

    let regression = report.event_study.regression.as_ref().unwrap();
    assert_eq!(regression.excluded_hours, 6);
    let run_hours = config.run_hours() as usize + 1;
    assert_eq!(regression.observations, run_hours);
    assert_eq!(
        regression.missing_control_hours,
        window_hours - 6 - run_hours
    );
    assert!(regression.peg_deviation.is_some());
    assert!(report.event_study.window.is_ok());

    let losses = report.losses.as_ref().unwrap();
    assert_eq!(losses.wallets.len(), 30);
    assert!(losses
        .wallets
        .iter()
        .all(|l| (0.0..=1.0).contains(&l.loss_rate)));

    let summary = report.summary_json().unwrap();
    assert_eq!(summary["wallets"], 30);
    assert!(summary["hazard"]["cox"]["coefficients"].is_array());
}

#[test]
fn test_estimator_failure_is_isolated() {
    let config = config();
    // Without prices only the loss stage fails.
    let mut inputs = scenario(&config);
    inputs.prices.clear();
    let report = run(inputs, &config).unwrap();
    assert!(report.losses.is_err());
    assert!(report.hazard.cox.is_ok());
    let regression = report.event_study.regression.as_ref().unwrap();
    assert_eq!(regression.peg_deviation, None);
    assert_eq!(regression.missing_control_hours, 0);
    let summary = report.summary_json().unwrap();
    assert!(summary["losses"]["error"].is_string());
}

#[test]
fn test_raw_records_count_skips() {
    let config = PanelConfig::default();
    let payload = format!(
        r#"{{
            "txhash": "ABC",
            "timestamp": "2022-05-09T14:21:07Z",
            "tx": {{"body": {{"messages": [{{
                "@type": "/terra.wasm.v1beta1.MsgExecuteContract",
                "sender": "terra1depositor",
                "contract": "{market}",
                "execute_msg": {{"deposit_stable": {{}}}},
                "coins": [{{"denom": "uusd", "amount": "2500000"}}]
            }}]}}}},
            "logs": [{{"events": [{{"type": "wasm", "attributes": [
                {{"key": "contract_address", "value": "{market}"}},
                {{"key": "action", "value": "deposit_stable"}},
                {{"key": "deposit_amount", "value": "2500000"}}
            ]}}]}}]
        }}"#,
        market = config.market_contract
    );
    let records = vec![
        RawRecord::new(1, payload),
        RawRecord::new(2, "{not json"),
    ];
    let report = run(PipelineInputs::raw(records), &config).unwrap();
    assert_eq!(report.normalize.processed, 2);
    assert_eq!(report.normalize.skipped, 1);
    assert_eq!(report.normalize.emitted, 1);
    assert_eq!(report.wallet_hour.len(), 1);
    assert_eq!(report.wallet_hour[0].ust_inflow, 2.5);
    // The only wallet has no pre-run history.
    assert_eq!(report.unclassified.len(), 1);
}

#[test]
fn test_run_level_failures() {
    let config = PanelConfig {
        min_records_for_skip_check: 2,
        ..PanelConfig::default()
    };
    let garbage = (0..4).map(|i| RawRecord::new(i, "[]")).collect();
    assert!(matches!(
        run(PipelineInputs::raw(garbage), &config),
        Err(PanelError::SkipRateExceeded {
            skipped: 2,
            processed: 2,
            ..
        })
    ));

    let empty = PipelineInputs::tables(Vec::new(), Vec::new());
    assert!(matches!(run(empty, &config), Err(PanelError::EmptyPanel)));
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = PanelConfig {
        size_quantiles: 0,
        ..config()
    };
    let err = run(scenario(&config), &config).unwrap_err();
    assert!(matches!(err, PanelError::InvalidConfig(_)));
    assert!(err.to_string().contains("size_quantiles"));
}
