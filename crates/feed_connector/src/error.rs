//! Error types for the upstream feed connector.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Invalid feed URL: {0}")]
    InvalidUrl(String),

    #[error("DNS resolution failed: {0}")]
    Resolve(String),

    #[error("TLS config error: {0}")]
    Tls(String),

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection stale: no pong for {0} ms")]
    Stale(i64),

    #[error("Gave up after {0} reconnect attempts")]
    ReconnectExhausted(u32),
}

pub type Result<T> = std::result::Result<T, Error>;
