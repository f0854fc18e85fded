//! Wallet-level panel construction and run-dynamics estimators for a
//! deposit-token redemption run.
//!
//! The pipeline normalizes raw indexer records (or pre-extracted hourly
//! tables) into canonical events, builds a wallet-hour panel with running
//! balances and sticky exit flags, aggregates hourly concentration, and fits
//! three estimators: an early-exit hazard model, a whale-lag event study and
//! a loss breakdown by exit timing.

pub mod analysis;
pub mod config;
pub mod errors;
pub mod normalizer;
pub mod output;
pub mod panel;
pub mod pipeline;
pub mod stats_helpers;
pub(crate) mod timings;
pub mod types;

pub use config::{BalanceSource, PanelConfig};
pub use errors::{
    CensoringViolation, EstimationError, EstimationResult, MissingProfileError, PanelError,
    Result, SchemaError,
};
pub use normalizer::{EventStream, NormalizeStats, RawRecord};
pub use panel::{WalletPanel, WalletProfiles};
pub use pipeline::{run, EventSource, PipelineInputs, RunReport};
#[cfg(feature = "timings")]
pub use timings::init_subscriber;
pub use types::{Event, FlowType, Hour, HourPanel, WalletHourRecord, WalletId, WalletStatic};
