//! Trade router: `trade:*` → WebSocket fan-out.
//!
//! Holds one pattern subscription on the message bus for the whole gateway and
//! hands each batch to [`GatewayService::broadcast`], which filters by the
//! local reverse index.

use crate::error::{GatewayError, Result};
use crate::service::GatewayService;
use common::TradeBatch;
use ledger::MessageBus;
use metrics::counter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Routes published trade batches to subscribed WebSocket clients.
pub struct TradeRouter {
    service: Arc<GatewayService>,
    bus: Arc<dyn MessageBus>,
}

impl TradeRouter {
    pub fn new(service: Arc<GatewayService>, bus: Arc<dyn MessageBus>) -> Self {
        Self { service, bus }
    }

    /// Subscribe to every trade channel and route until shutdown.
    pub async fn run(self: Arc<Self>, shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        let trades = self.subscribe().await?;
        self.route(trades, shutdown_rx).await
    }

    pub async fn subscribe(&self) -> Result<mpsc::Receiver<TradeBatch>> {
        info!("[{}] Subscribing to trade channels", self.service.server_id());
        Ok(self.bus.subscribe_trades().await?)
    }

    pub async fn route(
        &self,
        mut trades: mpsc::Receiver<TradeBatch>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> Result<()> {
        info!("TradeRouter running");

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("TradeRouter received shutdown signal");
                    break;
                }

                batch = trades.recv() => {
                    match batch {
                        Some(batch) => {
                            counter!("gateway_trade_batches_received_total").increment(1);
                            let sent = self.service.broadcast(&batch);
                            debug!(
                                "Routed {} trade(s) for {} as {} frame(s)",
                                batch.data.len(),
                                batch.symbol,
                                sent
                            );
                        }
                        None => {
                            warn!("Trade subscription ended unexpectedly");
                            return Err(GatewayError::TradeStreamClosed);
                        }
                    }
                }
            }
        }

        info!("TradeRouter stopped");
        Ok(())
    }
}
