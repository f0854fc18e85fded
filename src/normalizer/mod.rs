//! Event normalization: raw indexer records and hourly tables into canonical events.
//!
//! Raw records are decoded through serde envelopes (`messages`), matched against
//! the deposit and composite redeem shapes (`decode`), and exposed as a lazy,
//! offset-keyed, resumable sequence (`stream`). The acquisition layer's hourly
//! tables go through the same validation (`tables`).

pub mod decode;
pub mod messages;
pub mod stream;
pub mod tables;

pub use decode::{decode_tx, match_message, parse_amount, FlowIntent};
pub use messages::RawTx;
pub use stream::{EventStream, NormalizeStats, RawRecord};
pub use tables::{
    events_from_tables, price_map, DepositRow, PriceRow, RedeemRow, WalletActivityRow,
};
