//! Connection liveness sweep and periodic stats logging.

use crate::service::GatewayService;
use metrics::gauge;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Probe every connection each `period`; a connection silent for two
/// consecutive periods is closed and disconnected.
pub async fn run_heartbeat(
    service: Arc<GatewayService>,
    period: Duration,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    info!("Connection heartbeat running every {:?}", period);

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                info!("Connection heartbeat received shutdown signal");
                break;
            }

            _ = ticker.tick() => {
                let dropped = service.heartbeat_tick();
                if dropped > 0 {
                    info!("[{}] Dropped {} unresponsive connection(s)", service.server_id(), dropped);
                } else {
                    debug!("[{}] Heartbeat sweep complete", service.server_id());
                }
            }
        }
    }
}

/// Log and export [`GatewayStats`](crate::service::GatewayStats) every `period`.
pub async fn run_stats_logger(
    service: Arc<GatewayService>,
    period: Duration,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => break,

            _ = ticker.tick() => {
                let stats = service.stats();
                gauge!("gateway_symbol_subscriptions").set(stats.total_symbol_subscriptions as f64);
                info!(
                    "[{}] Stats: connections={} active={} subscriptions={} sent={} received={} uptime={}s",
                    stats.server_id,
                    stats.total_connections,
                    stats.active_connections,
                    stats.total_symbol_subscriptions,
                    stats.messages_sent,
                    stats.messages_received,
                    stats.uptime
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::CLIENT_CHANNEL_BUFFER_SIZE;
    use crate::intents::IntentQueue;
    use axum::extract::ws::Message;

    #[tokio::test]
    async fn test_silent_connection_is_dropped() {
        let (queue, _intents) = IntentQueue::new("gw-test");
        let service = Arc::new(GatewayService::new(5, queue));
        let (tx, mut rx) = mpsc::channel(CLIENT_CHANNEL_BUFFER_SIZE);
        let connection = service.connect(None, tx);

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(run_heartbeat(
            service.clone(),
            Duration::from_millis(20),
            shutdown_rx,
        ));

        let dropped = tokio::time::timeout(Duration::from_secs(2), async {
            while service.registry().get(&connection.id).is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(dropped.is_ok());

        let mut saw_ping = false;
        let mut saw_close = false;
        while let Ok(frame) = rx.try_recv() {
            match frame {
                Message::Ping(_) => saw_ping = true,
                Message::Close(Some(frame)) => {
                    assert_eq!(frame.reason.as_str(), "Heartbeat timeout");
                    saw_close = true;
                }
                _ => {}
            }
        }
        assert!(saw_ping);
        assert!(saw_close);

        shutdown_tx.send(()).await.unwrap();
        handle.await.unwrap();
    }
}
