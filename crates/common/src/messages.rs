//! Messages shared between gateways, the connector manager, and the feed connector.

use crate::now_millis;
use crate::symbol::Symbol;
use serde::{Deserialize, Serialize};

// ============================================================================
// Control bus
// ============================================================================

/// What a gateway wants the connector manager to do with a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentAction {
    Subscribe,
    Unsubscribe,
}

impl IntentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentAction::Subscribe => "subscribe",
            IntentAction::Unsubscribe => "unsubscribe",
        }
    }
}

/// Subscribe/unsubscribe intent published by a gateway on the control bus.
///
/// Wire format: `{"action":"subscribe","symbol":"AAPL","serverId":"ws-gateway-1a2b3c4d","timestamp":1700000000000}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlIntent {
    pub action: IntentAction,
    pub symbol: Symbol,
    /// Identifier of the gateway process that wants (or no longer wants) the symbol.
    pub server_id: String,
    /// Epoch milliseconds at which the intent was created.
    pub timestamp: i64,
}

impl ControlIntent {
    pub fn new(action: IntentAction, symbol: Symbol, server_id: impl Into<String>) -> Self {
        Self {
            action,
            symbol,
            server_id: server_id.into(),
            timestamp: now_millis(),
        }
    }

    pub fn subscribe(symbol: Symbol, server_id: impl Into<String>) -> Self {
        Self::new(IntentAction::Subscribe, symbol, server_id)
    }

    pub fn unsubscribe(symbol: Symbol, server_id: impl Into<String>) -> Self {
        Self::new(IntentAction::Unsubscribe, symbol, server_id)
    }
}

// ============================================================================
// Trade fan-out
// ============================================================================

/// A single executed trade, normalised from the upstream provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeData {
    pub symbol: Symbol,
    pub price: f64,
    pub volume: f64,
    /// Exchange timestamp in epoch milliseconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<String>>,
}

/// All trades for one symbol from one upstream frame, published once on `trade:<SYMBOL>`.
///
/// Wire format: `{"type":"trade","symbol":"AAPL","data":[...],"timestamp":1700000000000}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "trade")]
pub struct TradeBatch {
    pub symbol: Symbol,
    pub data: Vec<TradeData>,
    /// Epoch milliseconds at which the batch was published.
    pub timestamp: i64,
}

impl TradeBatch {
    pub fn new(symbol: Symbol, data: Vec<TradeData>) -> Self {
        Self {
            symbol,
            data,
            timestamp: now_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_control_intent_wire_format() {
        let intent = ControlIntent {
            action: IntentAction::Subscribe,
            symbol: Symbol::new("aapl"),
            server_id: "ws-gateway-1".to_string(),
            timestamp: 42,
        };

        let value = serde_json::to_value(&intent).unwrap();
        assert_eq!(
            value,
            json!({"action":"subscribe","symbol":"AAPL","serverId":"ws-gateway-1","timestamp":42})
        );
    }

    #[test]
    fn test_control_intent_parses_lowercase_symbol() {
        let raw = r#"{"action":"unsubscribe","symbol":"tsla","serverId":"g2","timestamp":7}"#;
        let intent: ControlIntent = serde_json::from_str(raw).unwrap();
        assert_eq!(intent.action, IntentAction::Unsubscribe);
        assert_eq!(intent.symbol.as_str(), "TSLA");
        assert_eq!(intent.server_id, "g2");
    }

    #[test]
    fn test_trade_batch_carries_type_tag() {
        let batch = TradeBatch {
            symbol: Symbol::new("AAPL"),
            data: vec![TradeData {
                symbol: Symbol::new("AAPL"),
                price: 150.25,
                volume: 100.0,
                timestamp: 1,
                exchange: None,
                conditions: None,
            }],
            timestamp: 2,
        };

        let value = serde_json::to_value(&batch).unwrap();
        assert_eq!(value["type"], "trade");
        assert_eq!(value["data"][0]["price"], 150.25);
        assert!(value["data"][0].get("exchange").is_none());

        let parsed: TradeBatch = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, batch);
    }
}
