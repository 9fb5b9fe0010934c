//! Owner of the single upstream market-data socket.
//!
//! The connector keeps the set of symbols the upstream should be streaming,
//! replays it on every successful connect, publishes each incoming trade frame
//! onto the per-symbol trade channels, and reconnects with capped exponential
//! backoff until the attempt budget is spent.

use crate::config::FeedConfig;
use crate::error::{Error, Result};
use crate::upstream::{group_by_symbol, UpstreamMessage, UpstreamRequest, UpstreamTrade};
use common::{now_millis, Backoff, Symbol, TradeBatch};
use futures::{SinkExt, StreamExt};
use ledger::MessageBus;
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::{
    client_async_tls_with_config,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
    Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};
use url::Url;

type FeedSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Snapshot of the connector for heartbeats and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStatus {
    pub connected: bool,
    pub subscribed_symbols: Vec<Symbol>,
    pub reconnect_attempts: u32,
    /// Epoch milliseconds of the last liveness response, if any.
    pub last_pong_at: Option<i64>,
}

/// What the connector manager needs from the upstream feed.
///
/// Both calls are idempotent and never block on the network: when the socket
/// is down the symbol is only recorded and is sent on the next connect.
pub trait UpstreamFeed: Send + Sync + 'static {
    /// Returns true if the symbol was not already subscribed.
    fn subscribe(&self, symbol: &Symbol) -> bool;

    /// Returns true if the symbol was subscribed.
    fn unsubscribe(&self, symbol: &Symbol) -> bool;

    fn is_subscribed(&self, symbol: &Symbol) -> bool;

    fn status(&self) -> FeedStatus;
}

pub struct FeedConnector {
    config: FeedConfig,
    bus: Arc<dyn MessageBus>,
    subscribed: RwLock<BTreeSet<Symbol>>,
    /// Sender into the writer half of the live socket; `None` while disconnected.
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    connected: AtomicBool,
    reconnect_attempts: AtomicU32,
    last_pong_at: AtomicI64,
    shutting_down: AtomicBool,
    shutdown: Notify,
}

impl FeedConnector {
    pub fn new(config: FeedConfig, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            config,
            bus,
            subscribed: RwLock::new(BTreeSet::new()),
            outbound: Mutex::new(None),
            connected: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            last_pong_at: AtomicI64::new(0),
            shutting_down: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn subscribed_symbols(&self) -> Vec<Symbol> {
        self.subscribed.read().iter().cloned().collect()
    }

    /// Connect and stream until shutdown.
    ///
    /// Returns `Ok(())` after [`FeedConnector::shutdown`], or
    /// `Err(Error::ReconnectExhausted)` once `max_reconnect_attempts`
    /// consecutive attempts have failed. The caller is expected to exit on the
    /// latter so a supervisor can restart the process.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut backoff = Backoff::new(self.config.reconnect_delay, self.config.max_reconnect_delay);

        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }

            match self.connect_and_stream().await {
                Ok(()) => {
                    info!("Upstream feed closed gracefully");
                    break;
                }
                Err(e) => {
                    self.mark_disconnected();
                    if self.shutting_down.load(Ordering::SeqCst) {
                        break;
                    }

                    let attempts = self.reconnect_attempts.load(Ordering::SeqCst);
                    if attempts >= self.config.max_reconnect_attempts {
                        error!(
                            "Upstream feed lost ({}), giving up after {} reconnect attempts",
                            e, attempts
                        );
                        return Err(Error::ReconnectExhausted(attempts));
                    }

                    if attempts == 0 {
                        backoff.reset();
                    }
                    let delay = backoff.next_delay();
                    let attempt = attempts + 1;
                    self.reconnect_attempts.store(attempt, Ordering::SeqCst);

                    counter!("feed_reconnects_total").increment(1);
                    warn!(
                        "Upstream feed disconnected: {}, reconnecting in {:?} (attempt {}/{})",
                        e, delay, attempt, self.config.max_reconnect_attempts
                    );

                    tokio::select! {
                        biased;
                        _ = self.shutdown.notified() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.mark_disconnected();
        Ok(())
    }

    /// Stop the reconnect loop, unsubscribe every symbol, and close the socket normally.
    pub fn shutdown(&self) {
        info!("Shutting down upstream feed connector");
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    async fn connect_and_stream(&self) -> Result<()> {
        let endpoint = self.config.endpoint()?;
        info!("Connecting to upstream feed: {}", self.config.redacted_endpoint());

        let socket = match tokio::time::timeout(self.config.connect_timeout, open_socket(&endpoint)).await {
            Ok(socket) => socket?,
            Err(_) => return Err(Error::ConnectTimeout(self.config.connect_timeout)),
        };
        let (mut write, mut read) = socket.split();

        let (tx, mut rx) = mpsc::unbounded_channel();
        // Install the sender before snapshotting the set: a concurrent subscribe
        // either lands in the snapshot or sees the sender.
        *self.outbound.lock() = Some(tx.clone());

        self.connected.store(true, Ordering::SeqCst);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.last_pong_at.store(now_millis(), Ordering::SeqCst);
        gauge!("feed_connected").set(1.0);
        info!("Upstream feed connected");

        let replay = self.subscribed_symbols();
        if !replay.is_empty() {
            info!("Resubscribing to {} symbols", replay.len());
            for symbol in &replay {
                let _ = tx.send(Message::Text(UpstreamRequest::subscribe(symbol).to_json()));
            }
        }
        drop(tx);

        let stale_after = self.config.stale_after();
        let mut ping_interval = interval_at(
            Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    let symbols: Vec<Symbol> = std::mem::take(&mut *self.subscribed.write())
                        .into_iter()
                        .collect();
                    gauge!("feed_subscribed_symbols").set(0.0);
                    for symbol in &symbols {
                        let _ = write
                            .send(Message::Text(UpstreamRequest::unsubscribe(symbol).to_json()))
                            .await;
                    }
                    let close_frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "Normal closure".into(),
                    };
                    let _ = write.send(Message::Close(Some(close_frame))).await;
                    info!("Unsubscribed {} symbols and closed upstream socket", symbols.len());
                    return Ok(());
                }

                outgoing = rx.recv() => {
                    match outgoing {
                        Some(msg) => write.send(msg).await?,
                        None => return Err(Error::ConnectionClosed),
                    }
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            counter!("feed_messages_received_total").increment(1);
                            if let Err(e) = self.handle_upstream_text(&text).await {
                                warn!("Error handling upstream message: {}", e);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            debug!("Received ping, sending pong");
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            debug!("Received pong");
                            self.last_pong_at.store(now_millis(), Ordering::SeqCst);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("Upstream sent close frame: {:?}", frame);
                            return Err(Error::ConnectionClosed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(Error::WebSocket(e)),
                        None => return Err(Error::ConnectionClosed),
                    }
                }

                _ = ping_interval.tick() => {
                    let silent_for = now_millis() - self.last_pong_at.load(Ordering::SeqCst);
                    if silent_for > stale_after.as_millis() as i64 {
                        warn!("Upstream connection appears stale ({} ms since last pong)", silent_for);
                        return Err(Error::Stale(silent_for));
                    }
                    write.send(Message::Ping(Vec::new())).await?;
                }
            }
        }
    }

    /// Demultiplex one upstream text frame.
    ///
    /// Returns the number of per-symbol batches published.
    pub async fn handle_upstream_text(&self, text: &str) -> Result<usize> {
        match serde_json::from_str::<UpstreamMessage>(text)? {
            UpstreamMessage::Trade { data } => self.publish_trades(data).await,
            UpstreamMessage::Ping => {
                self.send(Message::Pong(Vec::new()));
                Ok(0)
            }
            UpstreamMessage::Error { msg } => {
                warn!("Upstream reported error: {}", msg.as_deref().unwrap_or("unknown"));
                Ok(0)
            }
            UpstreamMessage::Other => {
                debug!("Ignoring upstream frame: {}", text);
                Ok(0)
            }
        }
    }

    async fn publish_trades(&self, trades: Vec<UpstreamTrade>) -> Result<usize> {
        let mut published = 0;
        for (symbol, data) in group_by_symbol(trades) {
            let count = data.len();
            let batch = TradeBatch::new(symbol, data);
            match self.bus.publish_trades(&batch).await {
                Ok(()) => {
                    published += 1;
                    counter!("feed_trades_published_total").increment(count as u64);
                }
                Err(e) => {
                    counter!("feed_publish_errors_total").increment(1);
                    error!("Failed to publish {} trades for {}: {}", count, batch.symbol, e);
                }
            }
        }
        Ok(published)
    }

    /// Queue a frame for the live socket. Returns false while disconnected.
    fn send(&self, msg: Message) -> bool {
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    fn mark_disconnected(&self) {
        self.outbound.lock().take();
        if self.connected.swap(false, Ordering::SeqCst) {
            gauge!("feed_connected").set(0.0);
        }
    }
}

impl UpstreamFeed for FeedConnector {
    fn subscribe(&self, symbol: &Symbol) -> bool {
        if !self.subscribed.write().insert(symbol.clone()) {
            debug!("Already subscribed to {}", symbol);
            return false;
        }
        gauge!("feed_subscribed_symbols").increment(1.0);

        if self.send(Message::Text(UpstreamRequest::subscribe(symbol).to_json())) {
            info!("Subscribed to {}", symbol);
        } else {
            warn!("Upstream not connected, {} queued for next connect", symbol);
        }
        true
    }

    fn unsubscribe(&self, symbol: &Symbol) -> bool {
        if !self.subscribed.write().remove(symbol) {
            debug!("Not subscribed to {}", symbol);
            return false;
        }
        gauge!("feed_subscribed_symbols").decrement(1.0);

        if self.send(Message::Text(UpstreamRequest::unsubscribe(symbol).to_json())) {
            info!("Unsubscribed from {}", symbol);
        } else {
            debug!("Upstream not connected, {} dropped from replay set", symbol);
        }
        true
    }

    fn is_subscribed(&self, symbol: &Symbol) -> bool {
        self.subscribed.read().contains(symbol)
    }

    fn status(&self) -> FeedStatus {
        let last_pong = self.last_pong_at.load(Ordering::SeqCst);
        FeedStatus {
            connected: self.is_connected(),
            subscribed_symbols: self.subscribed_symbols(),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::SeqCst),
            last_pong_at: (last_pong > 0).then_some(last_pong),
        }
    }
}

/// Resolve, connect (IPv4 first), and perform the WebSocket handshake.
async fn open_socket(endpoint: &Url) -> Result<FeedSocket> {
    let host = endpoint
        .host_str()
        .ok_or_else(|| Error::InvalidUrl("no host".to_string()))?;
    let port = endpoint
        .port_or_known_default()
        .ok_or_else(|| Error::InvalidUrl("no port".to_string()))?;

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::Resolve(e.to_string()))?
        .collect();

    // Prefer IPv4 to avoid IPv6 timeout issues
    let mut sorted_addrs: Vec<SocketAddr> = addrs.iter().filter(|a| a.is_ipv4()).copied().collect();
    sorted_addrs.extend(addrs.iter().filter(|a| a.is_ipv6()).copied());
    debug!("Resolved {} to {:?}", host, sorted_addrs);

    let mut tcp_stream = None;
    let mut last_error = None;
    for addr in &sorted_addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                tcp_stream = Some(stream);
                break;
            }
            Err(e) => {
                debug!("TCP connect to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }
    let tcp_stream = match (tcp_stream, last_error) {
        (Some(stream), _) => stream,
        (None, Some(e)) => return Err(Error::WebSocket(e.into())),
        (None, None) => return Err(Error::Resolve(format!("no addresses for {}", host))),
    };
    let _ = tcp_stream.set_nodelay(true);

    let connector = if endpoint.scheme() == "wss" {
        Some(tls_connector()?)
    } else {
        None
    };

    let (socket, response) =
        client_async_tls_with_config(endpoint.as_str(), tcp_stream, None, connector).await?;
    debug!("WebSocket handshake complete, status: {:?}", response.status());
    Ok(socket)
}

fn tls_connector() -> Result<Connector> {
    let mut root_store = rustls::RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        let _ = root_store.add(cert);
    }

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Tls(e.to_string()))?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    Ok(Connector::Rustls(Arc::new(config)))
}
