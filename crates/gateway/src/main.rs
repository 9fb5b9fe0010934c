//! Gateway service entry point.
//!
//! WebSocket gateway fanning out upstream trades to subscribed clients.

use anyhow::{Context, Result};
use gateway::{
    create_router, run_heartbeat, run_stats_logger, AppState, GatewayConfig, GatewayService,
    IntentPublisher, IntentQueue, TradeRouter,
};
use ledger::redis_client::redact_url;
use ledger::{MessageBus, RedisLedger};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
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

    info!("Starting Gateway service");

    let config = GatewayConfig::from_env().context("invalid configuration")?;

    info!("Configuration:");
    info!("  GATEWAY_ID: {}", config.server_id);
    info!("  WS_PORT: {}", config.port);
    info!("  REDIS_URL: {}", redact_url(&config.redis_url));
    info!("  MAX_SYMBOLS_PER_CONNECTION: {}", config.max_symbols_per_connection);
    info!("  HEARTBEAT_INTERVAL: {:?}", config.heartbeat_interval);
    info!("  METRICS_PORT: {}", config.metrics_port);

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .context("failed to start Prometheus exporter")?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    // Connect to Redis
    let bus: Arc<dyn MessageBus> = Arc::new(
        RedisLedger::connect(&config.redis_url, config.ledger.clone())
            .await
            .context("failed to connect to Redis")?,
    );

    let (intents, intent_rx) = IntentQueue::new(config.server_id.clone());
    let service = Arc::new(GatewayService::new(
        config.max_symbols_per_connection,
        intents,
    ));

    let (publisher_shutdown_tx, publisher_shutdown_rx) = mpsc::channel(1);
    let publisher = IntentPublisher::new(
        intent_rx,
        bus.clone(),
        config.intent_retry_attempts,
        config.intent_retry_delay,
    );
    let publisher_handle = tokio::spawn(publisher.run(publisher_shutdown_rx));

    // Subscribe before accepting clients so no trade for a new subscriber is missed.
    let router = Arc::new(TradeRouter::new(service.clone(), bus.clone()));
    let trades = router.subscribe().await.context("failed to subscribe to trades")?;
    let (router_shutdown_tx, router_shutdown_rx) = mpsc::channel(1);
    let router_clone = router.clone();
    let router_handle = tokio::spawn(async move {
        if let Err(e) = router_clone.route(trades, router_shutdown_rx).await {
            error!("Router error: {:?}", e);
        }
    });

    let (heartbeat_shutdown_tx, heartbeat_shutdown_rx) = mpsc::channel(1);
    let heartbeat_handle = tokio::spawn(run_heartbeat(
        service.clone(),
        config.heartbeat_interval,
        heartbeat_shutdown_rx,
    ));

    let (stats_shutdown_tx, stats_shutdown_rx) = mpsc::channel(1);
    let stats_handle = tokio::spawn(run_stats_logger(
        service.clone(),
        config.stats_interval,
        stats_shutdown_rx,
    ));

    let state = Arc::new(AppState {
        service: service.clone(),
    });
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!("[{}] Gateway listening on {}", config.server_id, addr);

    let closing = service.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            closing.shutdown();
        })
        .await?;

    info!("Shutting down background tasks...");
    let _ = heartbeat_shutdown_tx.send(()).await;
    let _ = stats_shutdown_tx.send(()).await;
    let _ = router_shutdown_tx.send(()).await;
    let _ = heartbeat_handle.await;
    let _ = stats_handle.await;
    let _ = router_handle.await;

    // Publish the unsubscribes produced by closing every client.
    let _ = publisher_shutdown_tx.send(()).await;
    if tokio::time::timeout(Duration::from_secs(10), publisher_handle)
        .await
        .is_err()
    {
        warn!("Intent queue did not drain within 10s");
    }

    info!("Gateway stopped");
    Ok(())
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
