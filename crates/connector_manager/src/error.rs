//! Error types for the connector manager.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger::Error),

    #[error("Feed error: {0}")]
    Feed(#[from] feed_connector::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] common::env::EnvError),

    #[error("Control bus closed")]
    ControlBusClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
