//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Ledger or message bus error.
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger::Error),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(#[from] common::env::EnvError),

    /// Trade subscription ended.
    #[error("Trade stream closed")]
    TradeStreamClosed,
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
