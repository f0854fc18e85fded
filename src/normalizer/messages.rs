//! Wire shapes of indexer transaction records.
//!
//! Two envelopes are accepted for transaction messages: the protobuf-JSON form
//! (`{"@type": "...", ...}`) served by LCD nodes and the amino form
//! (`{"type": "...", "value": {...}}`) served by FCD.

use serde::Deserialize;
use serde_json::Value;

/// One transaction as returned by the indexer.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTx {
    #[serde(default)]
    pub txhash: Option<String>,
    pub timestamp: String,
    pub tx: TxEnvelope,
    #[serde(default)]
    pub logs: Vec<TxLog>,
    #[serde(default)]
    pub raw_log: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TxEnvelope {
    Body { body: TxBody },
    Legacy { value: LegacyTxValue },
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxBody {
    #[serde(default)]
    pub messages: Vec<RawMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LegacyTxValue {
    #[serde(default)]
    pub msg: Vec<RawMessage>,
}

impl TxEnvelope {
    pub fn messages(&self) -> &[RawMessage] {
        match self {
            TxEnvelope::Body { body } => &body.messages,
            TxEnvelope::Legacy { value } => &value.msg,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawMessage {
    Proto(ProtoMessage),
    Amino(AminoMessage),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "@type")]
pub enum ProtoMessage {
    #[serde(
        rename = "/terra.wasm.v1beta1.MsgExecuteContract",
        alias = "/cosmwasm.wasm.v1.MsgExecuteContract"
    )]
    ExecuteContract(ExecuteContract),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AminoMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub value: Value,
}

const AMINO_EXECUTE_CONTRACT: &str = "wasm/MsgExecuteContract";

impl RawMessage {
    /// The contract-execution payload, if this message is one.
    pub fn execute_contract(&self) -> Option<ExecuteContract> {
        match self {
            RawMessage::Proto(ProtoMessage::ExecuteContract(msg)) => Some(msg.clone()),
            RawMessage::Proto(ProtoMessage::Other) => None,
            RawMessage::Amino(msg) if msg.kind == AMINO_EXECUTE_CONTRACT => {
                serde_json::from_value(msg.value.clone()).ok()
            }
            RawMessage::Amino(_) => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteContract {
    pub sender: String,
    pub contract: String,
    /// Either an inline JSON object or a base64 string of one.
    #[serde(default, alias = "msg")]
    pub execute_msg: Value,
    #[serde(default, alias = "funds")]
    pub coins: Vec<Coin>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Coin {
    pub denom: String,
    pub amount: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TxLog {
    #[serde(default)]
    pub events: Vec<LogEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Attribute {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

impl RawTx {
    /// Structured logs, falling back to the JSON-encoded `raw_log`.
    pub fn log_events(&self) -> Vec<LogEvent> {
        if !self.logs.is_empty() {
            return self
                .logs
                .iter()
                .flat_map(|log| log.events.iter().cloned())
                .collect();
        }
        let Some(raw) = self.raw_log.as_deref() else {
            return Vec::new();
        };
        if raw.is_empty() || raw == "[]" {
            return Vec::new();
        }
        serde_json::from_str::<Vec<TxLog>>(raw)
            .map(|logs| logs.into_iter().flat_map(|log| log.events).collect())
            .unwrap_or_default()
    }
}
