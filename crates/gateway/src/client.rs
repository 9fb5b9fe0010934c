//! Client connection state and the per-gateway reverse index.
//!
//! Lock order is always connection symbols first, then an index shard. Readers
//! of the index copy the bucket out before touching any connection.

use crate::intents::IntentQueue;
use crate::protocol::ServerMessage;
use axum::extract::ws::{CloseFrame, Message};
use chrono::{DateTime, Utc};
use common::Symbol;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::gauge;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};
use uuid::Uuid;

/// Unique connection identifier.
pub type ConnectionId = Uuid;

/// Outbound frames buffered per connection before new ones are dropped.
pub const CLIENT_CHANNEL_BUFFER_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Debug view of one connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub subscribed_symbols: Vec<Symbol>,
    pub connected_at: DateTime<Utc>,
    /// Seconds since accept.
    pub connection_duration: i64,
    pub is_alive: bool,
    pub state: ConnectionState,
}

/// State for a single client socket.
pub struct ClientConnection {
    pub id: ConnectionId,
    pub user_id: Option<String>,
    pub connected_at: DateTime<Utc>,
    tx: mpsc::Sender<Message>,
    symbols: Mutex<BTreeSet<Symbol>>,
    alive: AtomicBool,
    state: AtomicU8,
    close: Notify,
}

impl ClientConnection {
    pub fn new(user_id: Option<String>, tx: mpsc::Sender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            connected_at: Utc::now(),
            tx,
            symbols: Mutex::new(BTreeSet::new()),
            alive: AtomicBool::new(true),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            close: Notify::new(),
        }
    }

    /// Queue a frame. Returns false if the buffer is full or the socket is gone.
    pub fn send(&self, msg: &ServerMessage) -> bool {
        self.send_text(msg.to_text())
    }

    pub fn send_text(&self, text: String) -> bool {
        self.send_raw(Message::Text(text.into()))
    }

    pub fn send_raw(&self, msg: Message) -> bool {
        if self.state() == ConnectionState::Closed {
            return false;
        }
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(e) => {
                debug!("Failed to send to connection {}: {}", self.id, e);
                false
            }
        }
    }

    pub fn is_subscribed_to(&self, symbol: &Symbol) -> bool {
        self.symbols.lock().contains(symbol)
    }

    /// Subscribed symbols in sorted order.
    pub fn subscribed_symbols(&self) -> Vec<Symbol> {
        self.symbols.lock().iter().cloned().collect()
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.lock().len()
    }

    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    pub fn mark_suspect(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Send a close frame and ask the socket task to stop.
    pub fn close(&self, code: u16, reason: &str) {
        let state = self.state();
        if state == ConnectionState::Closing || state == ConnectionState::Closed {
            return;
        }
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        let _ = self.tx.try_send(Message::Close(Some(frame)));
        self.set_state(ConnectionState::Closing);
        self.close.notify_one();
    }

    /// Resolves once [`ClientConnection::close`] has been called.
    pub async fn close_requested(&self) {
        self.close.notified().await
    }

    pub fn duration_secs(&self) -> i64 {
        (Utc::now() - self.connected_at).num_seconds()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            user_id: self.user_id.clone(),
            subscribed_symbols: self.subscribed_symbols(),
            connected_at: self.connected_at,
            connection_duration: self.duration_secs(),
            is_alive: self.is_alive(),
            state: self.state(),
        }
    }
}

/// Result of a subscribe attempt against the per-connection cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// Symbols that were new to the connection (possibly empty).
    Added(Vec<Symbol>),
    /// Nothing changed; the request would exceed `cap`.
    CapExceeded { cap: usize, current: usize },
    /// The connection is already closed.
    Closed,
}

/// Registry of live connections plus the symbol → connections reverse index.
///
/// Every index mutation queues its control intent while the bucket is still
/// locked, so the intent queue sees mutations in the order they happened.
pub struct ClientRegistry {
    connections: DashMap<ConnectionId, Arc<ClientConnection>>,
    symbol_index: DashMap<Symbol, HashSet<ConnectionId>>,
    intents: IntentQueue,
}

impl ClientRegistry {
    pub fn new(intents: IntentQueue) -> Self {
        Self {
            connections: DashMap::new(),
            symbol_index: DashMap::new(),
            intents,
        }
    }

    pub fn register(&self, connection: Arc<ClientConnection>) -> ConnectionId {
        let id = connection.id;
        connection.set_state(ConnectionState::Open);
        self.connections.insert(id, connection);
        gauge!("gateway_active_connections").set(self.connections.len() as f64);
        id
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.get(id).map(|c| c.clone())
    }

    /// Add the not-yet-subscribed symbols of `requested` to the connection,
    /// unless that would take it past `cap`.
    pub fn subscribe(
        &self,
        connection: &ClientConnection,
        requested: &[Symbol],
        cap: usize,
    ) -> SubscribeOutcome {
        let mut symbols = connection.symbols.lock();
        if connection.state() == ConnectionState::Closed {
            return SubscribeOutcome::Closed;
        }

        let new: Vec<Symbol> = requested
            .iter()
            .filter(|s| !symbols.contains(*s))
            .cloned()
            .collect();
        if symbols.len() + new.len() > cap {
            return SubscribeOutcome::CapExceeded {
                cap,
                current: symbols.len(),
            };
        }

        for symbol in &new {
            symbols.insert(symbol.clone());
            let mut bucket = self.symbol_index.entry(symbol.clone()).or_default();
            bucket.insert(connection.id);
            self.intents.subscribe(symbol);
        }

        gauge!("gateway_subscribed_symbols").set(self.symbol_index.len() as f64);
        SubscribeOutcome::Added(new)
    }

    /// Remove the requested symbols the connection holds. Returns those removed.
    pub fn unsubscribe(&self, connection: &ClientConnection, requested: &[Symbol]) -> Vec<Symbol> {
        let mut symbols = connection.symbols.lock();
        let mut removed = Vec::new();
        for symbol in requested {
            if symbols.remove(symbol) {
                self.remove_from_index(symbol, &connection.id);
                removed.push(symbol.clone());
            }
        }
        gauge!("gateway_subscribed_symbols").set(self.symbol_index.len() as f64);
        removed
    }

    /// Drop the connection and all of its index entries. Returns the symbols it
    /// held, or `None` if it was already removed.
    pub fn remove(&self, id: &ConnectionId) -> Option<Vec<Symbol>> {
        let (_, connection) = self.connections.remove(id)?;

        let mut symbols = connection.symbols.lock();
        connection.set_state(ConnectionState::Closed);
        let held: Vec<Symbol> = std::mem::take(&mut *symbols).into_iter().collect();
        for symbol in &held {
            self.remove_from_index(symbol, id);
        }
        drop(symbols);

        gauge!("gateway_active_connections").set(self.connections.len() as f64);
        gauge!("gateway_subscribed_symbols").set(self.symbol_index.len() as f64);
        Some(held)
    }

    fn remove_from_index(&self, symbol: &Symbol, id: &ConnectionId) {
        if let Entry::Occupied(mut bucket) = self.symbol_index.entry(symbol.clone()) {
            bucket.get_mut().remove(id);
            if bucket.get().is_empty() {
                // Queue before the bucket lock is released.
                self.intents.unsubscribe(symbol);
                bucket.remove();
                info!("No local subscribers left for {}", symbol);
            }
        }
    }

    /// Connection ids currently indexed under `symbol`.
    pub fn connection_ids_for(&self, symbol: &Symbol) -> Vec<ConnectionId> {
        self.symbol_index
            .get(symbol)
            .map(|bucket| bucket.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Connections currently indexed under `symbol`.
    pub fn subscribers(&self, symbol: &Symbol) -> Vec<Arc<ClientConnection>> {
        self.connection_ids_for(symbol)
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    pub fn connections(&self) -> Vec<Arc<ClientConnection>> {
        self.connections.iter().map(|c| c.value().clone()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Symbols with at least one local subscriber.
    pub fn symbol_count(&self) -> usize {
        self.symbol_index.len()
    }

    /// Copy of the reverse index, ordered for comparison.
    pub fn index_snapshot(&self) -> BTreeMap<Symbol, BTreeSet<ConnectionId>> {
        self.symbol_index
            .iter()
            .map(|bucket| (bucket.key().clone(), bucket.value().iter().copied().collect()))
            .collect()
    }
}
