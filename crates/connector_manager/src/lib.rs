//! Connector manager: the single arbiter that owns the upstream feed.
//!
//! Gateways publish subscribe/unsubscribe intents on the control bus. The
//! manager records each one in the shared ledger and calls through to the feed
//! only on the first-member and last-member transitions.

pub mod config;
pub mod error;
pub mod heartbeat;
pub mod manager;

pub use config::ManagerConfig;
pub use error::{Error, Result};
pub use heartbeat::{run_heartbeat, write_heartbeat, HeartbeatSnapshot};
pub use manager::{ConnectorManager, Decision, ReconcileReport};
