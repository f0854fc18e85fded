//! Pure matching of decoded transactions against the deposit and redeem shapes.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::messages::{Coin, ExecuteContract, LogEvent, RawTx};
use crate::config::PanelConfig;
use crate::errors::SchemaError;
use crate::types::{truncate_hour, Event};

const DEPOSIT_ACTION: &str = "deposit_stable";
const REDEEM_ACTION: &str = "redeem_stable";
const SEND_ACTION: &str = "send";
const STABLE_DENOM: &str = "uusd";
const CONTRACT_KEYS: [&str; 2] = ["contract_address", "_contract_address"];
const LOG_EVENT_KINDS: [&str; 3] = ["wasm", "execute_contract", "from_contract"];

/// Parse an amount field into UST.
///
/// Accepts coin lists (`"1500uusd,20uluna"`), bare micro-unit integers and
/// decimal UST strings.
pub fn parse_amount(text: &str, micro_scale: f64) -> Result<f64, SchemaError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(SchemaError::InvalidAmount(text.to_string()));
    }
    let value = if text.contains(STABLE_DENOM) {
        let micro = text
            .split(',')
            .map(str::trim)
            .find_map(|part| part.strip_suffix(STABLE_DENOM))
            .ok_or_else(|| SchemaError::InvalidAmount(text.to_string()))?;
        micro
            .parse::<f64>()
            .map_err(|_| SchemaError::InvalidAmount(text.to_string()))?
            / micro_scale
    } else if text.bytes().all(|b| b.is_ascii_digit()) {
        text.parse::<f64>()
            .map_err(|_| SchemaError::InvalidAmount(text.to_string()))?
            / micro_scale
    } else {
        text.parse::<f64>()
            .map_err(|_| SchemaError::InvalidAmount(text.to_string()))?
    };
    validate_amount(value)
}

pub(crate) fn validate_amount(value: f64) -> Result<f64, SchemaError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(SchemaError::NegativeAmount(value))
    }
}

pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, SchemaError> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| SchemaError::InvalidTimestamp(text.to_string()))
}

/// Decode an embedded contract message: inline JSON or base64-encoded JSON.
pub fn decode_embedded(value: &Value) -> Result<Value, SchemaError> {
    match value {
        Value::String(encoded) => {
            let bytes = STANDARD
                .decode(encoded.trim())
                .map_err(|err| SchemaError::EmbeddedMessage(err.to_string()))?;
            serde_json::from_slice(&bytes).map_err(|err| SchemaError::EmbeddedMessage(err.to_string()))
        }
        Value::Object(_) => Ok(value.clone()),
        Value::Null => Err(SchemaError::MissingField("execute_msg")),
        other => Err(SchemaError::EmbeddedMessage(format!(
            "unexpected payload {other}"
        ))),
    }
}

/// One `action` block inside a contract log event.
#[derive(Debug, Clone, PartialEq)]
pub struct LogSegment {
    pub action: String,
    pub contract: Option<String>,
    attributes: Vec<(String, String)>,
}

impl LogSegment {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Split contract log events into per-action segments, tracking the emitting contract.
pub fn log_segments(events: &[LogEvent]) -> Vec<LogSegment> {
    let mut segments = Vec::new();
    for event in events {
        if !LOG_EVENT_KINDS.contains(&event.kind.as_str()) {
            continue;
        }
        let mut current: Option<LogSegment> = None;
        let mut contract: Option<String> = None;
        for attr in &event.attributes {
            let value = attr.value.clone().unwrap_or_default();
            if CONTRACT_KEYS.contains(&attr.key.as_str()) {
                contract = Some(value);
                continue;
            }
            if attr.key == "action" {
                if let Some(done) = current.take() {
                    segments.push(done);
                }
                current = Some(LogSegment {
                    action: value,
                    contract: contract.clone(),
                    attributes: Vec::new(),
                });
                continue;
            }
            if let Some(segment) = current.as_mut() {
                segment.attributes.push((attr.key.clone(), value));
            }
        }
        if let Some(done) = current {
            segments.push(done);
        }
    }
    segments
}

/// A message that matched a known shape, before the confirmed amount is attached.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowIntent {
    Deposit {
        wallet: String,
        /// `uusd` attached to the message, in UST.
        attached: Option<f64>,
    },
    Redeem {
        wallet: String,
        /// aUST requested for redemption.
        aust_sent: f64,
    },
}

fn has_key(value: &Value, key: &str) -> bool {
    value.as_object().is_some_and(|obj| obj.contains_key(key))
}

fn attached_stable(coins: &[Coin], micro_scale: f64) -> Option<f64> {
    coins
        .iter()
        .find(|coin| coin.denom == STABLE_DENOM)
        .and_then(|coin| coin.amount.parse::<f64>().ok())
        .map(|micro| micro / micro_scale)
}

/// Match one contract execution against the deposit and composite redeem shapes.
///
/// `Ok(None)` means the message is unrelated; `Err` means it has a known shape but
/// a broken payload.
pub fn match_message(
    msg: &ExecuteContract,
    config: &PanelConfig,
) -> Result<Option<FlowIntent>, SchemaError> {
    let micro_scale = config.micro_scale();
    if msg.contract == config.market_contract {
        let body = decode_embedded(&msg.execute_msg)?;
        if has_key(&body, DEPOSIT_ACTION) {
            return Ok(Some(FlowIntent::Deposit {
                wallet: msg.sender.clone(),
                attached: attached_stable(&msg.coins, micro_scale),
            }));
        }
        return Ok(None);
    }

    if msg.contract != config.aust_contract {
        return Ok(None);
    }
    let body = decode_embedded(&msg.execute_msg)?;
    let Some(send) = body.get(SEND_ACTION) else {
        return Ok(None);
    };
    let target = send.get("contract").and_then(Value::as_str);
    if target != Some(config.market_contract.as_str()) {
        return Ok(None);
    }
    let inner = decode_embedded(send.get("msg").unwrap_or(&Value::Null))?;
    if !has_key(&inner, REDEEM_ACTION) {
        return Ok(None);
    }
    let requested = send
        .get("amount")
        .and_then(Value::as_str)
        .ok_or(SchemaError::MissingField("send.amount"))?;
    let aust_sent = parse_amount(requested, micro_scale)?;
    Ok(Some(FlowIntent::Redeem {
        wallet: msg.sender.clone(),
        aust_sent,
    }))
}

fn confirmed_amount(
    segment: Option<&LogSegment>,
    keys: &[&str],
    micro_scale: f64,
) -> Result<Option<f64>, SchemaError> {
    let Some(segment) = segment else {
        return Ok(None);
    };
    for key in keys {
        if let Some(raw) = segment.get(key) {
            return parse_amount(raw, micro_scale).map(Some);
        }
    }
    Ok(None)
}

fn is_market_segment(segment: &LogSegment, action: &str, config: &PanelConfig) -> bool {
    segment.action == action
        && segment
            .contract
            .as_deref()
            .map_or(true, |c| c == config.market_contract)
}

/// Decode every qualifying message in a transaction into events.
///
/// Qualifying messages are paired in order with the market contract's
/// `deposit_stable` / `redeem_stable` log segments, whose amounts are the
/// settled values.
pub fn decode_tx(tx: &RawTx, offset: u64, config: &PanelConfig) -> Result<Vec<Event>, SchemaError> {
    let hour = truncate_hour(parse_timestamp(&tx.timestamp)?);
    let micro_scale = config.micro_scale();
    let segments = log_segments(&tx.log_events());
    let mut deposits = segments
        .iter()
        .filter(|seg| is_market_segment(seg, DEPOSIT_ACTION, config));
    let mut redeems = segments
        .iter()
        .filter(|seg| is_market_segment(seg, REDEEM_ACTION, config));

    let mut events = Vec::new();
    for raw in tx.tx.messages() {
        let Some(msg) = raw.execute_contract() else {
            continue;
        };
        let Some(intent) = match_message(&msg, config)? else {
            continue;
        };
        let event = match intent {
            FlowIntent::Deposit { wallet, attached } => {
                let confirmed =
                    confirmed_amount(deposits.next(), &["deposit_amount", "amount"], micro_scale)?;
                let amount = confirmed
                    .or(attached)
                    .ok_or(SchemaError::MissingField("deposit_amount"))?;
                Event::deposit(wallet, hour, amount)
            }
            FlowIntent::Redeem { wallet, aust_sent } => {
                let confirmed =
                    confirmed_amount(redeems.next(), &["redeem_amount", "amount"], micro_scale)?;
                // Without a settled amount the aUST figure stands in downstream.
                Event::redeem(wallet, hour, confirmed.unwrap_or(0.0), aust_sent)
            }
        };
        events.push(event.with_offset(offset));
    }
    Ok(events)
}


#[cfg(test)]
mod tests {
    use super::fixtures::{deposit_tx, redeem_tx};
    use super::*;
    use crate::types::FlowType;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde_json::json;

    fn decode(payload: &str, config: &PanelConfig) -> Result<Vec<Event>, SchemaError> {
        let tx: RawTx = serde_json::from_str(payload).unwrap();
        decode_tx(&tx, 7, config)
    }

    #[test]
    fn test_parse_amount_forms() {
        assert_eq!(parse_amount("2500000uusd", 1e6).unwrap(), 2.5);
        assert_eq!(parse_amount("10uluna, 1000000uusd", 1e6).unwrap(), 1.0);
        assert_eq!(parse_amount("3000000", 1e6).unwrap(), 3.0);
        assert_eq!(parse_amount("12.5", 1e6).unwrap(), 12.5);
        assert!(parse_amount("abc", 1e6).is_err());
        assert!(parse_amount("-4.0", 1e6).is_err());
        assert!(parse_amount("5uluna", 1e6).is_err());
    }

    #[test]
    fn test_decode_deposit() {
        let config = PanelConfig::default();
        let events =
            decode(&deposit_tx(&config, "terra1abc", "2022-05-09T13:47:12Z", 1_500_000), &config).unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.flow_type, FlowType::Deposit);
        assert_eq!(event.wallet.as_str(), "terra1abc");
        assert_eq!(event.amount, 1.5);
        assert_eq!(event.offset, 7);
        assert_eq!(event.hour.to_rfc3339(), "2022-05-09T13:00:00+00:00");
    }

    #[test]
    fn test_redeem_prefers_settled_amount() {
        let config = PanelConfig::default();
        let events = decode(
            &redeem_tx(&config, "terra1xyz", "2022-05-09T14:05:00Z", 1_000_000, Some(1_180_000)),
            &config,
        )
        .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].flow_type, FlowType::Redeem);
        assert_eq!(events[0].amount, 1.18);
        assert_eq!(events[0].aust_sent, 1.0);
    }

    #[test]
    fn test_redeem_without_settlement_keeps_request() {
        let config = PanelConfig::default();
        let events = decode(
            &redeem_tx(&config, "terra1xyz", "2022-05-09T14:05:00Z", 2_000_000, None),
            &config,
        )
        .unwrap();
        assert_eq!(events[0].amount, 0.0);
        assert_eq!(events[0].aust_sent, 2.0);
    }

    #[test]
    fn test_plain_transfer_is_not_a_redeem() {
        let config = PanelConfig::default();
        let payload = json!({
            "timestamp": "2022-05-09T14:05:00Z",
            "tx": {"body": {"messages": [{
                "@type": "/terra.wasm.v1beta1.MsgExecuteContract",
                "sender": "terra1xyz",
                "contract": config.aust_contract,
                "execute_msg": {"transfer": {"recipient": "terra1other", "amount": "100"}},
                "coins": []
            }, {
                "@type": "/cosmos.bank.v1beta1.MsgSend",
                "from_address": "terra1xyz",
                "to_address": "terra1other",
                "amount": []
            }]}}
        })
        .to_string();
        assert!(decode(&payload, &config).unwrap().is_empty());
    }

    #[test]
    fn test_amino_envelope_and_raw_log() {
        let config = PanelConfig::default();
        let raw_log = json!([{"events": [{"type": "wasm", "attributes": [
            {"key": "contract_address", "value": config.market_contract},
            {"key": "action", "value": "deposit_stable"},
            {"key": "deposit_amount", "value": "4000000"}
        ]}]}])
        .to_string();
        let payload = json!({
            "timestamp": "2022-05-08T01:00:00Z",
            "tx": {"value": {"msg": [{
                "type": "wasm/MsgExecuteContract",
                "value": {
                    "sender": "terra1amino",
                    "contract": config.market_contract,
                    "execute_msg": STANDARD.encode(br#"{"deposit_stable":{}}"#),
                    "coins": [{"denom": "uusd", "amount": "4000000"}]
                }
            }]}},
            "raw_log": raw_log
        })
        .to_string();
        let events = decode(&payload, &config).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].amount, 4.0);
        assert_eq!(events[0].wallet.as_str(), "terra1amino");
    }

    #[test]
    fn test_bad_embedded_message_is_schema_error() {
        let config = PanelConfig::default();
        let payload = json!({
            "timestamp": "2022-05-09T14:05:00Z",
            "tx": {"body": {"messages": [{
                "@type": "/terra.wasm.v1beta1.MsgExecuteContract",
                "sender": "terra1xyz",
                "contract": config.aust_contract,
                "execute_msg": {"send": {
                    "contract": config.market_contract,
                    "amount": "100",
                    "msg": "%%%not-base64%%%"
                }},
                "coins": []
            }]}}
        })
        .to_string();
        assert!(matches!(
            decode(&payload, &config),
            Err(SchemaError::EmbeddedMessage(_))
        ));
    }

    #[test]
    fn test_segments_track_contract() {
        let events: Vec<LogEvent> = serde_json::from_value(json!([{
            "type": "wasm",
            "attributes": [
                {"key": "contract_address", "value": "A"},
                {"key": "action", "value": "send"},
                {"key": "amount", "value": "1"},
                {"key": "contract_address", "value": "B"},
                {"key": "action", "value": "redeem_stable"},
                {"key": "redeem_amount", "value": "2"}
            ]
        }]))
        .unwrap();
        let segments = log_segments(&events);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].contract.as_deref(), Some("A"));
        assert_eq!(segments[1].contract.as_deref(), Some("B"));
        assert_eq!(segments[1].get("redeem_amount"), Some("2"));
    }
}
