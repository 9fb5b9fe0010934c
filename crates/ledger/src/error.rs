//! Error types for the subscription ledger and message bus.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Ledger operation timed out: {0}")]
    Timeout(&'static str),

    #[error("Ledger unavailable")]
    Unavailable,

    #[error("Invalid channel name: {0}")]
    InvalidChannel(String),
}

pub type Result<T> = std::result::Result<T, Error>;
