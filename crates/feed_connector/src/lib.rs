//! Upstream market-data feed connector.
//!
//! [`FeedConnector`] owns the one socket to the provider. It is driven by the
//! connector manager through the [`UpstreamFeed`] trait and republishes trades
//! through a [`ledger::MessageBus`].

pub mod config;
pub mod connector;
pub mod error;
pub mod upstream;

pub use config::FeedConfig;
pub use connector::{FeedConnector, FeedStatus, UpstreamFeed};
pub use error::{Error, Result};
