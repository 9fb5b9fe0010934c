//! Periodic liveness snapshot written to the ledger for external monitoring.

use crate::error::Result;
use common::now_millis;
use feed_connector::{FeedStatus, UpstreamFeed};
use ledger::{LedgerStats, SubscriptionLedger};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatSnapshot {
    pub timestamp: i64,
    pub status: FeedStatus,
    pub stats: LedgerStats,
}

/// Build the snapshot and store it under the heartbeat key with `ttl`.
pub async fn write_heartbeat(
    ledger: &dyn SubscriptionLedger,
    feed: &dyn UpstreamFeed,
    ttl: Duration,
) -> Result<HeartbeatSnapshot> {
    let stats = ledger.stats().await?;
    let status = feed.status();

    info!(
        "Heartbeat: connected={} subscribedToFeed={} totalSymbolsWithSubscribers={} reconnectAttempts={}",
        status.connected,
        status.subscribed_symbols.len(),
        stats.total_symbols,
        status.reconnect_attempts
    );

    let snapshot = HeartbeatSnapshot {
        timestamp: now_millis(),
        status,
        stats,
    };
    let payload = serde_json::to_string(&snapshot).map_err(ledger::Error::from)?;
    ledger.write_heartbeat(&payload, ttl).await?;
    Ok(snapshot)
}

/// Write a heartbeat every `interval` until shutdown. Failures are logged only.
pub async fn run_heartbeat(
    ledger: Arc<dyn SubscriptionLedger>,
    feed: Arc<dyn UpstreamFeed>,
    interval: Duration,
    ttl: Duration,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut ticker = interval_at(Instant::now() + interval, interval);

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                info!("Heartbeat stopped");
                return;
            }

            _ = ticker.tick() => {
                if let Err(e) = write_heartbeat(ledger.as_ref(), feed.as_ref(), ttl).await {
                    warn!("Error in heartbeat: {}", e);
                }
            }
        }
    }
}
