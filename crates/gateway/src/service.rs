//! Per-gateway connection handling: request dispatch, fan-out, liveness.

use crate::client::{
    ClientConnection, ClientRegistry, ConnectionId, ConnectionInfo, SubscribeOutcome,
};
use crate::intents::IntentQueue;
use crate::protocol::{
    parse_client_message, ClientRequest, ServerMessage, SubscribedData, UnsubscribedData,
    WelcomeData,
};
use axum::body::Bytes;
use axum::extract::ws::Message;
use common::{Symbol, TradeBatch};
use metrics::counter;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Close code sent to connections that missed two heartbeats.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code sent to every connection on shutdown.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Snapshot served on `/health` and logged periodically.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    pub server_id: String,
    pub total_connections: usize,
    pub active_connections: usize,
    pub total_symbol_subscriptions: usize,
    /// Seconds since the service was created.
    pub uptime: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

pub struct GatewayService {
    server_id: String,
    max_symbols_per_connection: usize,
    registry: ClientRegistry,
    started_at: Instant,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

impl GatewayService {
    pub fn new(max_symbols_per_connection: usize, intents: IntentQueue) -> Self {
        Self {
            server_id: intents.server_id().to_string(),
            max_symbols_per_connection,
            registry: ClientRegistry::new(intents),
            started_at: Instant::now(),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Register a freshly accepted socket and greet it.
    pub fn connect(
        &self,
        user_id: Option<String>,
        tx: mpsc::Sender<Message>,
    ) -> Arc<ClientConnection> {
        let connection = Arc::new(ClientConnection::new(user_id, tx));
        self.registry.register(connection.clone());
        counter!("gateway_connections_total").increment(1);

        info!(
            "[{}] Client connected: {} (user: {})",
            self.server_id,
            connection.id,
            connection.user_id.as_deref().unwrap_or("anonymous")
        );

        let welcome = WelcomeData {
            connection_id: connection.id.to_string(),
            server_id: self.server_id.clone(),
            max_symbols_per_connection: self.max_symbols_per_connection,
        };
        self.send(
            &connection,
            &ServerMessage::success("Connected to WebSocket Gateway", to_value(&welcome)),
        );
        connection
    }

    /// Dispatch one inbound text frame. Protocol errors are answered on the
    /// same connection and never close it.
    pub fn handle_text(&self, connection: &ClientConnection, raw: &str) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        counter!("gateway_messages_received_total").increment(1);

        let request = match parse_client_message(raw) {
            Ok(request) => request,
            Err(e) => {
                debug!("[{}] Rejected frame from {}: {}", self.server_id, connection.id, e);
                self.send(connection, &ServerMessage::error(e.0));
                return;
            }
        };

        match request {
            ClientRequest::Subscribe { symbols } => self.handle_subscribe(connection, &symbols),
            ClientRequest::Unsubscribe { symbols } => self.handle_unsubscribe(connection, &symbols),
            ClientRequest::Ping => {
                connection.mark_alive();
                self.send(connection, &ServerMessage::pong());
            }
        }
    }

    fn handle_subscribe(&self, connection: &ClientConnection, symbols: &[Symbol]) {
        let cap = self.max_symbols_per_connection;
        match self.registry.subscribe(connection, symbols, cap) {
            SubscribeOutcome::Added(added) => {
                let message = if added.is_empty() {
                    "Already subscribed to all requested symbols".to_string()
                } else {
                    format!("Successfully subscribed to {} symbol(s)", added.len())
                };
                counter!("gateway_subscriptions_total").increment(added.len() as u64);
                info!(
                    "[{}] {} subscribed to {:?}",
                    self.server_id, connection.id, added
                );

                let data = SubscribedData {
                    subscribed: added,
                    current_subscriptions: connection.subscribed_symbols(),
                };
                self.send(connection, &ServerMessage::success(message, to_value(&data)));
            }
            SubscribeOutcome::CapExceeded { cap, current } => {
                counter!("gateway_subscription_rejections_total").increment(1);
                self.send(
                    connection,
                    &ServerMessage::error(format!(
                        "Cannot subscribe: would exceed maximum of {} symbols per connection. Currently subscribed to {} symbols.",
                        cap, current
                    )),
                );
            }
            SubscribeOutcome::Closed => {}
        }
    }

    fn handle_unsubscribe(&self, connection: &ClientConnection, symbols: &[Symbol]) {
        let removed = self.registry.unsubscribe(connection, symbols);
        let message = if removed.is_empty() {
            "Not subscribed to any of the requested symbols".to_string()
        } else {
            format!("Successfully unsubscribed from {} symbol(s)", removed.len())
        };
        info!(
            "[{}] {} unsubscribed from {:?}",
            self.server_id, connection.id, removed
        );

        let data = UnsubscribedData {
            unsubscribed: removed,
            current_subscriptions: connection.subscribed_symbols(),
        };
        self.send(connection, &ServerMessage::success(message, to_value(&data)));
    }

    /// A pong frame or protocol-level ping from the client.
    pub fn handle_pong(&self, connection: &ClientConnection) {
        connection.mark_alive();
    }

    /// Forget the connection. Safe to call more than once.
    pub fn disconnect(&self, id: &ConnectionId) {
        if let Some(symbols) = self.registry.remove(id) {
            counter!("gateway_disconnections_total").increment(1);
            info!(
                "[{}] Client disconnected: {} (had {} symbol(s))",
                self.server_id,
                id,
                symbols.len()
            );
        }
    }

    /// Deliver every trade in the batch to each local subscriber of its symbol.
    /// Returns the number of frames queued.
    pub fn broadcast(&self, batch: &TradeBatch) -> usize {
        let recipients = self.registry.subscribers(&batch.symbol);
        if recipients.is_empty() {
            debug!("[{}] No subscribers for {}, dropping batch", self.server_id, batch.symbol);
            return 0;
        }

        let mut sent = 0usize;
        for trade in &batch.data {
            let text = ServerMessage::trade(trade.clone()).to_text();
            for connection in &recipients {
                // The index copy may predate an unsubscribe.
                if !connection.is_subscribed_to(&batch.symbol) {
                    continue;
                }
                if connection.send_text(text.clone()) {
                    sent += 1;
                }
            }
        }

        self.messages_sent.fetch_add(sent as u64, Ordering::Relaxed);
        counter!("gateway_messages_sent_total").increment(sent as u64);
        sent
    }

    /// Drop connections that never answered the previous probe, then probe the
    /// rest. Returns the number dropped.
    pub fn heartbeat_tick(&self) -> usize {
        let mut dropped = 0usize;
        for connection in self.registry.connections() {
            if !connection.is_alive() {
                warn!(
                    "[{}] Heartbeat timeout for {}, closing",
                    self.server_id, connection.id
                );
                connection.close(CLOSE_NORMAL, "Heartbeat timeout");
                self.disconnect(&connection.id);
                dropped += 1;
                continue;
            }
            connection.mark_suspect();
            connection.send_raw(Message::Ping(Bytes::new()));
        }

        if dropped > 0 {
            counter!("gateway_heartbeat_timeouts_total").increment(dropped as u64);
        }
        dropped
    }

    /// Close every connection and release all of their subscriptions.
    pub fn shutdown(&self) {
        let connections = self.registry.connections();
        info!(
            "[{}] Closing {} connection(s)",
            self.server_id,
            connections.len()
        );
        for connection in connections {
            connection.close(CLOSE_GOING_AWAY, "Server shutting down");
            self.disconnect(&connection.id);
        }
    }

    pub fn stats(&self) -> GatewayStats {
        let connections = self.registry.connections();
        GatewayStats {
            server_id: self.server_id.clone(),
            total_connections: connections.len(),
            active_connections: connections.iter().filter(|c| c.is_alive()).count(),
            total_symbol_subscriptions: connections.iter().map(|c| c.symbol_count()).sum(),
            uptime: self.started_at.elapsed().as_secs(),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
        }
    }

    pub fn connection_info(&self) -> Vec<ConnectionInfo> {
        self.registry.connections().iter().map(|c| c.info()).collect()
    }

    fn send(&self, connection: &ClientConnection, message: &ServerMessage) {
        if connection.send(message) {
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn to_value<T: Serialize>(data: &T) -> Option<serde_json::Value> {
    serde_json::to_value(data).ok()
}
