//! Provider wire format.
//!
//! Outbound: `{"type":"subscribe","symbol":"AAPL"}` / `{"type":"unsubscribe",...}`.
//! Inbound: `{"type":"trade","data":[{"s":"AAPL","p":150.25,"t":1700000000000,"v":100}]}`,
//! `{"type":"ping"}`, or `{"type":"error","msg":"..."}`.

use common::{Symbol, TradeData};
use serde::{Deserialize, Serialize};

/// Subscription request sent to the provider.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamRequest<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub symbol: &'a str,
}

impl<'a> UpstreamRequest<'a> {
    pub fn subscribe(symbol: &'a Symbol) -> Self {
        Self {
            kind: "subscribe",
            symbol: symbol.as_str(),
        }
    }

    pub fn unsubscribe(symbol: &'a Symbol) -> Self {
        Self {
            kind: "unsubscribe",
            symbol: symbol.as_str(),
        }
    }

    pub fn to_json(&self) -> String {
        // Two string fields; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Frames the provider sends.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UpstreamMessage {
    Trade {
        #[serde(default)]
        data: Vec<UpstreamTrade>,
    },
    Ping,
    Error {
        #[serde(default)]
        msg: Option<String>,
    },
    #[serde(other)]
    Other,
}

/// One trade in the provider's short-key form. Long keys are accepted too.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamTrade {
    #[serde(rename = "s", alias = "symbol")]
    pub symbol: String,
    #[serde(rename = "p", alias = "price")]
    pub price: f64,
    #[serde(rename = "t", alias = "timestamp")]
    pub timestamp: i64,
    #[serde(rename = "v", alias = "volume", default)]
    pub volume: f64,
    #[serde(rename = "x", alias = "exchange", default)]
    pub exchange: Option<String>,
    #[serde(rename = "c", alias = "conditions", default)]
    pub conditions: Option<Vec<String>>,
}

impl From<UpstreamTrade> for TradeData {
    fn from(trade: UpstreamTrade) -> Self {
        TradeData {
            symbol: Symbol::new(trade.symbol),
            price: trade.price,
            volume: trade.volume,
            timestamp: trade.timestamp,
            exchange: trade.exchange,
            conditions: trade.conditions,
        }
    }
}

/// Group trades by symbol.
///
/// Groups appear in order of each symbol's first trade, and trades keep their
/// upstream order within a group.
pub fn group_by_symbol(trades: Vec<UpstreamTrade>) -> Vec<(Symbol, Vec<TradeData>)> {
    let mut groups: Vec<(Symbol, Vec<TradeData>)> = Vec::new();
    for trade in trades {
        let data = TradeData::from(trade);
        match groups.iter_mut().find(|(symbol, _)| *symbol == data.symbol) {
            Some((_, bucket)) => bucket.push(data),
            None => groups.push((data.symbol.clone(), vec![data])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trade_frame() {
        let raw = r#"{"type":"trade","data":[
            {"s":"AAPL","p":150.25,"t":1700000000000,"v":100,"c":["1","12"]},
            {"symbol":"tsla","price":240.5,"timestamp":1700000000001,"volume":3}
        ]}"#;

        let UpstreamMessage::Trade { data } = serde_json::from_str(raw).unwrap() else {
            panic!("expected trade frame");
        };
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].symbol, "AAPL");
        assert_eq!(data[0].conditions.as_deref(), Some(&["1".to_string(), "12".to_string()][..]));
        assert_eq!(data[1].price, 240.5);
    }

    #[test]
    fn test_parse_control_frames() {
        assert!(matches!(
            serde_json::from_str::<UpstreamMessage>(r#"{"type":"ping"}"#).unwrap(),
            UpstreamMessage::Ping
        ));
        assert!(matches!(
            serde_json::from_str::<UpstreamMessage>(r#"{"type":"error","msg":"Invalid token"}"#).unwrap(),
            UpstreamMessage::Error { msg: Some(m) } if m == "Invalid token"
        ));
        assert!(matches!(
            serde_json::from_str::<UpstreamMessage>(r#"{"type":"news","data":[]}"#).unwrap(),
            UpstreamMessage::Other
        ));
    }

    #[test]
    fn test_group_by_symbol_preserves_order() {
        let trade = |s: &str, p: f64| UpstreamTrade {
            symbol: s.to_string(),
            price: p,
            timestamp: 1,
            volume: 1.0,
            exchange: None,
            conditions: None,
        };

        let groups = group_by_symbol(vec![
            trade("MSFT", 1.0),
            trade("aapl", 2.0),
            trade("MSFT", 3.0),
            trade("AAPL", 4.0),
        ]);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, Symbol::new("MSFT"));
        assert_eq!(
            groups[0].1.iter().map(|t| t.price).collect::<Vec<_>>(),
            vec![1.0, 3.0]
        );
        assert_eq!(groups[1].0, Symbol::new("AAPL"));
        assert_eq!(
            groups[1].1.iter().map(|t| t.price).collect::<Vec<_>>(),
            vec![2.0, 4.0]
        );
    }

    #[test]
    fn test_request_json() {
        let symbol = Symbol::new("aapl");
        assert_eq!(
            UpstreamRequest::subscribe(&symbol).to_json(),
            r#"{"type":"subscribe","symbol":"AAPL"}"#
        );
        assert_eq!(
            UpstreamRequest::unsubscribe(&symbol).to_json(),
            r#"{"type":"unsubscribe","symbol":"AAPL"}"#
        );
    }
}
