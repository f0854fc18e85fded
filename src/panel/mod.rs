//! Wallet-hour panel construction.
//!
//! `profile` builds the static pre-run snapshot, `builder` folds per-wallet
//! running state and exit flags, `concentration` aggregates each hour.

pub mod builder;
pub mod concentration;
pub mod profile;

pub use builder::{aggregate_events, build_wallet_panel, WalletExit, WalletPanel};
pub use concentration::{aggregate_hours, hhi};
pub use profile::{activity_from_events, Activity, WalletProfiles};
