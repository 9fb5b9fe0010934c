//! Connector manager entry point.
//!
//! Owns the upstream feed socket and arbitrates subscribe/unsubscribe intents
//! from every gateway. Exits non-zero when the feed gives up reconnecting so a
//! supervisor can restart the process.

use anyhow::{Context, Result};
use connector_manager::{run_heartbeat, ConnectorManager, ManagerConfig};
use feed_connector::FeedConnector;
use ledger::redis_client::redact_url;
use ledger::{MessageBus, RedisLedger, SubscriptionLedger};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting connector manager");

    let config = ManagerConfig::from_env().context("invalid configuration")?;

    info!("Configuration:");
    info!("  REDIS_URL: {}", redact_url(&config.redis_url));
    info!("  FEED_URL: {}", config.feed.redacted_endpoint());
    info!("  FEED_API_KEY present: {}", config.feed.api_key.is_some());
    info!("  HEARTBEAT_INTERVAL: {:?}", config.heartbeat_interval);
    info!("  METRICS_PORT: {}", config.metrics_port);

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .context("failed to start Prometheus exporter")?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    // Connect to Redis
    let redis = Arc::new(
        RedisLedger::connect(&config.redis_url, config.ledger.clone())
            .await
            .context("failed to connect to Redis")?,
    );
    let ledger: Arc<dyn SubscriptionLedger> = redis.clone();
    let bus: Arc<dyn MessageBus> = redis;

    let feed = Arc::new(FeedConnector::new(config.feed.clone(), bus.clone()));
    let manager = Arc::new(ConnectorManager::new(
        ledger.clone(),
        feed.clone(),
        config.ledger_retry_attempts,
        config.ledger_retry_delay,
    ));

    let mut feed_handle = tokio::spawn(feed.clone().run());

    let (manager_shutdown_tx, manager_shutdown_rx) = mpsc::channel(1);
    let mut manager_handle = tokio::spawn(manager.run(bus.clone(), manager_shutdown_rx));

    let (heartbeat_shutdown_tx, heartbeat_shutdown_rx) = mpsc::channel(1);
    let heartbeat_handle = tokio::spawn(run_heartbeat(
        ledger,
        feed.clone(),
        config.heartbeat_interval,
        config.heartbeat_ttl,
        heartbeat_shutdown_rx,
    ));

    info!("Connector manager started");

    let (exit, stopped) = tokio::select! {
        result = &mut feed_handle => (feed_exit(result), Stopped::Feed),
        result = &mut manager_handle => (manager_exit(result), Stopped::Manager),
        _ = shutdown_signal() => (Ok(()), Stopped::Neither),
    };

    info!("Shutting down connector manager...");
    let _ = heartbeat_shutdown_tx.send(()).await;
    let _ = heartbeat_handle.await;

    if stopped != Stopped::Manager {
        let _ = manager_shutdown_tx.send(()).await;
        if let Err(e) = manager_exit(manager_handle.await) {
            warn!("{:#}", e);
        }
    }

    if stopped != Stopped::Feed {
        feed.shutdown();
        if tokio::time::timeout(Duration::from_secs(5), &mut feed_handle)
            .await
            .is_err()
        {
            warn!("Upstream feed did not close within 5s");
            feed_handle.abort();
        }
    }

    info!("Connector manager stopped");
    exit
}

/// Which task ended the main select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stopped {
    Feed,
    Manager,
    Neither,
}

fn feed_exit(result: Result<feed_connector::Result<()>, JoinError>) -> Result<()> {
    match result {
        Ok(Ok(())) => {
            warn!("Upstream feed stopped unexpectedly");
            Err(anyhow::anyhow!("upstream feed stopped"))
        }
        Ok(Err(e)) => {
            error!("Upstream feed failed: {}", e);
            Err(anyhow::Error::new(e).context("upstream feed failed"))
        }
        Err(e) => Err(anyhow::Error::new(e).context("upstream feed task panicked")),
    }
}

/// The arbiter returning early leaves every gateway intent unhandled, so
/// anything other than a requested shutdown is fatal.
fn manager_exit(result: Result<connector_manager::Result<()>, JoinError>) -> Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("Manager loop failed: {}", e);
            Err(anyhow::Error::new(e).context("connector manager loop failed"))
        }
        Err(e) => Err(anyhow::Error::new(e).context("connector manager task panicked")),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
