//! Client WebSocket protocol.
//!
//! Client → server: `{"action":"subscribe","symbols":["AAPL"]}`,
//! `{"action":"unsubscribe","symbols":["AAPL"]}`, `{"action":"ping"}`.
//!
//! Server → client: `success`, `error`, `trade` and `pong` frames, each
//! stamped with the server time in epoch milliseconds.

use common::{now_millis, Symbol, TradeData};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Most symbols a single subscribe request may name.
pub const MAX_SYMBOLS_PER_REQUEST: usize = 5;

/// Longest accepted symbol, in characters.
pub const MAX_SYMBOL_LEN: usize = 10;

// ============================================================================
// Client → Server Messages
// ============================================================================

/// A validated client request. Symbols are already canonical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Subscribe { symbols: Vec<Symbol> },
    Unsubscribe { symbols: Vec<Symbol> },
    Ping,
}

#[derive(Debug, Deserialize)]
struct SymbolsPayload {
    symbols: Vec<String>,
}

/// A request the client got wrong. Reported back as an error frame; the
/// connection stays open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError(pub String);

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ProtocolError {}

/// Parse and validate one inbound text frame.
pub fn parse_client_message(raw: &str) -> Result<ClientRequest, ProtocolError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| ProtocolError(format!("Invalid message format: {}", e)))?;

    let action = match value.get("action") {
        Some(Value::String(action)) => action.clone(),
        _ => {
            return Err(ProtocolError(
                "Invalid message format: missing action field".to_string(),
            ))
        }
    };

    match action.as_str() {
        "subscribe" => {
            let symbols = parse_symbols(&action, value, 1, Some(MAX_SYMBOLS_PER_REQUEST))?;
            Ok(ClientRequest::Subscribe { symbols })
        }
        "unsubscribe" => {
            let symbols = parse_symbols(&action, value, 1, None)?;
            Ok(ClientRequest::Unsubscribe { symbols })
        }
        "ping" => Ok(ClientRequest::Ping),
        other => Err(ProtocolError(format!("Unknown action: {}", other))),
    }
}

fn parse_symbols(
    action: &str,
    value: Value,
    min: usize,
    max: Option<usize>,
) -> Result<Vec<Symbol>, ProtocolError> {
    let invalid = |detail: String| ProtocolError(format!("Invalid {} message: {}", action, detail));

    let payload: SymbolsPayload =
        serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;

    if payload.symbols.len() < min {
        return Err(invalid(format!("symbols must contain at least {} item(s)", min)));
    }
    if let Some(max) = max {
        if payload.symbols.len() > max {
            return Err(invalid(format!("symbols must contain at most {} item(s)", max)));
        }
    }

    let mut symbols: Vec<Symbol> = Vec::with_capacity(payload.symbols.len());
    for raw in &payload.symbols {
        let len = raw.trim().chars().count();
        if len == 0 || len > MAX_SYMBOL_LEN {
            return Err(invalid(format!(
                "symbol {:?} must be 1-{} characters",
                raw, MAX_SYMBOL_LEN
            )));
        }
        let symbol = Symbol::new(raw);
        if !symbols.contains(&symbol) {
            symbols.push(symbol);
        }
    }
    Ok(symbols)
}

// ============================================================================
// Server → Client Messages
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Success {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        timestamp: i64,
    },
    Error {
        message: String,
        timestamp: i64,
    },
    Trade {
        data: TradeData,
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
}

impl ServerMessage {
    pub fn success(message: impl Into<String>, data: Option<Value>) -> Self {
        ServerMessage::Success {
            message: message.into(),
            data,
            timestamp: now_millis(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            timestamp: now_millis(),
        }
    }

    pub fn trade(data: TradeData) -> Self {
        ServerMessage::Trade {
            data,
            timestamp: now_millis(),
        }
    }

    pub fn pong() -> Self {
        ServerMessage::Pong {
            timestamp: now_millis(),
        }
    }

    /// Serialize for the wire.
    pub fn to_text(&self) -> String {
        // Every variant is plain data with string keys.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Payload of the welcome frame.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeData {
    pub connection_id: String,
    pub server_id: String,
    pub max_symbols_per_connection: usize,
}

/// Payload of a subscribe reply.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribedData {
    pub subscribed: Vec<Symbol>,
    pub current_subscriptions: Vec<Symbol>,
}

/// Payload of an unsubscribe reply.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribedData {
    pub unsubscribed: Vec<Symbol>,
    pub current_subscriptions: Vec<Symbol>,
}
