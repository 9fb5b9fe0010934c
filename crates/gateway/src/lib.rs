//! Gateway service for real-time trade streaming to WebSocket clients.
//!
//! This service:
//! - Accepts WebSocket connections and validates client requests
//! - Enforces the per-connection symbol cap
//! - Keeps a symbol → connection reverse index for local fan-out
//! - Publishes ordered subscribe/unsubscribe intents on the control bus
//! - Routes `trade:*` batches to subscribed clients
//!
//! ## Architecture
//!
//! ```text
//! client ──subscribe──▶ GatewayService ──▶ IntentQueue ──▶ IntentPublisher ──▶ feed:control
//!                            │
//!                       ClientRegistry (connections + reverse index)
//!                            ▲
//! trade:* ──▶ TradeRouter ───┘──▶ matching clients
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod intents;
pub mod protocol;
pub mod router;
pub mod service;
pub mod ws_server;

pub use client::{
    ClientConnection, ClientRegistry, ConnectionId, ConnectionInfo, ConnectionState,
    SubscribeOutcome,
};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use heartbeat::{run_heartbeat, run_stats_logger};
pub use intents::{IntentPublisher, IntentQueue};
pub use protocol::{parse_client_message, ClientRequest, ProtocolError, ServerMessage};
pub use router::TradeRouter;
pub use service::{GatewayService, GatewayStats};
pub use ws_server::{create_router, AppState};
