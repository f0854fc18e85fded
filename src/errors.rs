use chrono::{DateTime, Utc};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PanelError>;

/// Run-level failures. Anything listed here aborts the whole pipeline.
#[derive(Debug, Error)]
pub enum PanelError {
    #[error(
        "skip rate {rate:.4} exceeds limit {max_rate:.4} ({skipped} of {processed} records skipped); \
         check the field mapping"
    )]
    SkipRateExceeded {
        skipped: u64,
        processed: u64,
        rate: f64,
        max_rate: f64,
    },
    #[error("no events inside the sample window")]
    EmptyPanel,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// A single input record that does not fit the expected shape. Recovered locally.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("unparseable payload: {0}")]
    MalformedPayload(String),
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("invalid amount {0:?}")]
    InvalidAmount(String),
    #[error("negative or non-finite amount {0}")]
    NegativeAmount(f64),
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
    #[error("embedded message could not be decoded: {0}")]
    EmbeddedMessage(String),
}

/// Wallet with activity but no usable static profile.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MissingProfileError {
    #[error("wallet {0} has no pre-window profile")]
    NoProfile(String),
    #[error("wallet {wallet} has non-positive pre-run balance {balance}")]
    NonPositiveBalance { wallet: String, balance: f64 },
}

impl MissingProfileError {
    pub fn wallet(&self) -> &str {
        match self {
            MissingProfileError::NoProfile(wallet) => wallet,
            MissingProfileError::NonPositiveBalance { wallet, .. } => wallet,
        }
    }
}

pub type EstimationResult<T> = std::result::Result<T, EstimationError>;

/// Model-level failures. Abort only the stage that raised them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EstimationError {
    #[error("{stage}: insufficient sample ({observations} observations, need {required})")]
    InsufficientSample {
        stage: &'static str,
        observations: usize,
        required: usize,
    },
    #[error("{stage}: no covariate has variance (dropped: {dropped:?})")]
    DegenerateCovariates {
        stage: &'static str,
        dropped: Vec<String>,
    },
    #[error("hazard: no exit events among {wallets} wallets")]
    NoEvents { wallets: usize },
    #[error(
        "hazard: no convergence after {iterations} iterations \
         ({wallets} wallets, {events} events, last step {last_step:.3e})"
    )]
    DidNotConverge {
        iterations: usize,
        wallets: usize,
        events: usize,
        last_step: f64,
    },
    #[error("{stage}: singular design matrix ({observations} observations, {parameters} parameters)")]
    Singular {
        stage: &'static str,
        observations: usize,
        parameters: usize,
    },
    #[error("{stage}: no price available {detail}")]
    MissingPrices {
        stage: &'static str,
        detail: String,
    },
}

/// Exit hour computed outside the observation window. Drops the wallet's row.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("wallet {wallet} exit hour {exit_hour} outside observation window [{window_start}, {window_end}]")]
pub struct CensoringViolation {
    pub wallet: String,
    pub exit_hour: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}
