//! Control-plane arbiter between the gateways and the single upstream feed.
//!
//! Every gateway intent goes through the ledger first. Only the intent that
//! leaves the symbol with exactly one member subscribes upstream, and only the
//! one that leaves it empty unsubscribes.

use crate::error::{Error, Result};
use common::{retry_with_backoff, Backoff, ControlIntent, IntentAction, Symbol};
use feed_connector::UpstreamFeed;
use ledger::{MembershipChange, MessageBus, SubscriptionLedger};
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// What handling one intent did to the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    SubscribedUpstream,
    UnsubscribedUpstream,
    NoChange,
}

/// Result of the startup pass over the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Symbols with members, now subscribed upstream.
    pub restored: Vec<Symbol>,
    /// Symbols whose entry existed but was empty, now removed.
    pub collected: Vec<Symbol>,
}

pub struct ConnectorManager {
    ledger: Arc<dyn SubscriptionLedger>,
    feed: Arc<dyn UpstreamFeed>,
    retry_attempts: u32,
    retry_backoff: Backoff,
}

impl ConnectorManager {
    pub fn new(
        ledger: Arc<dyn SubscriptionLedger>,
        feed: Arc<dyn UpstreamFeed>,
        retry_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            ledger,
            feed,
            retry_attempts,
            retry_backoff: Backoff::new(retry_delay, retry_delay.saturating_mul(8)),
        }
    }

    /// Apply one gateway intent.
    pub async fn handle_intent(&self, intent: &ControlIntent) -> Decision {
        info!(
            "Received {} intent for {} from {}",
            intent.action.as_str(),
            intent.symbol,
            intent.server_id
        );
        counter!("manager_intents_total", "action" => intent.action.as_str()).increment(1);

        let decision = match intent.action {
            IntentAction::Subscribe => self.handle_subscribe(&intent.symbol, &intent.server_id).await,
            IntentAction::Unsubscribe => {
                self.handle_unsubscribe(&intent.symbol, &intent.server_id).await
            }
        };

        gauge!("manager_upstream_symbols").set(self.feed.status().subscribed_symbols.len() as f64);
        decision
    }

    async fn handle_subscribe(&self, symbol: &Symbol, gateway_id: &str) -> Decision {
        let ledger = &self.ledger;
        let result: ledger::Result<MembershipChange> = retry_with_backoff(
            "ledger add",
            self.retry_attempts,
            self.retry_backoff.clone(),
            move || ledger.add_gateway(symbol, gateway_id),
        )
        .await;

        match result {
            Ok(change) if change.is_sole_member() => {
                debug!("{} now wanted by {} only, subscribing upstream", symbol, gateway_id);
                self.subscribe_upstream(symbol)
            }
            Ok(change) => {
                debug!("{} already wanted by {} gateways", symbol, change.members);
                Decision::NoChange
            }
            Err(e) => {
                // A missing upstream subscription loses trades; a spare one only costs bandwidth.
                error!(
                    "Ledger unavailable for subscribe {} from {}: {}, subscribing upstream anyway",
                    symbol, gateway_id, e
                );
                self.subscribe_upstream(symbol)
            }
        }
    }

    async fn handle_unsubscribe(&self, symbol: &Symbol, gateway_id: &str) -> Decision {
        let ledger = &self.ledger;
        let result: ledger::Result<MembershipChange> = retry_with_backoff(
            "ledger remove",
            self.retry_attempts,
            self.retry_backoff.clone(),
            move || ledger.remove_gateway(symbol, gateway_id),
        )
        .await;

        match result {
            Ok(change) if change.is_empty() => {
                debug!("{} has no gateways left, unsubscribing upstream", symbol);
                if self.feed.unsubscribe(symbol) {
                    counter!("manager_upstream_unsubscribes_total").increment(1);
                    Decision::UnsubscribedUpstream
                } else {
                    Decision::NoChange
                }
            }
            Ok(change) => {
                debug!("{} still wanted by {} gateways", symbol, change.members);
                Decision::NoChange
            }
            Err(e) => {
                error!(
                    "Ledger unavailable for unsubscribe {} from {}: {}, leaving upstream subscribed",
                    symbol, gateway_id, e
                );
                Decision::NoChange
            }
        }
    }

    fn subscribe_upstream(&self, symbol: &Symbol) -> Decision {
        if self.feed.subscribe(symbol) {
            counter!("manager_upstream_subscribes_total").increment(1);
            Decision::SubscribedUpstream
        } else {
            Decision::NoChange
        }
    }

    /// Bring the upstream in line with the ledger after a restart.
    ///
    /// Symbols with members are subscribed; empty leftover entries are removed.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut symbols = self.ledger.symbols().await?;
        symbols.sort();

        if symbols.is_empty() {
            info!("No existing subscriptions to restore");
            return Ok(ReconcileReport::default());
        }
        info!("Restoring {} subscriptions from ledger", symbols.len());

        let mut report = ReconcileReport::default();
        for symbol in symbols {
            if self.ledger.has_subscribers(&symbol).await? {
                self.feed.subscribe(&symbol);
                report.restored.push(symbol);
            } else {
                self.ledger.remove_symbol(&symbol).await?;
                report.collected.push(symbol);
            }
        }

        info!(
            "Subscription restoration complete: {} restored, {} stale entries removed",
            report.restored.len(),
            report.collected.len()
        );
        Ok(report)
    }

    /// Reconcile until it succeeds. Returns false if shutdown arrived first.
    async fn reconcile_until_ready(&self, shutdown_rx: &mut mpsc::Receiver<()>) -> bool {
        let mut backoff = self.retry_backoff.clone();

        loop {
            let delay = tokio::select! {
                biased;

                _ = shutdown_rx.recv() => return false,

                result = self.reconcile() => match result {
                    Ok(_) => return true,
                    Err(e) => {
                        counter!("manager_reconcile_failures_total").increment(1);
                        let delay = backoff.next_delay();
                        warn!(
                            "Error restoring subscriptions (attempt {}): {}, retrying in {:?}",
                            backoff.attempt(),
                            e,
                            delay
                        );
                        delay
                    }
                }
            };

            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Consume control intents until shutdown.
    ///
    /// The control subscription is opened before reconciling so intents
    /// published during the reconcile pass are buffered, not lost. None are
    /// handled until the ledger has been reconciled.
    pub async fn run(
        self: Arc<Self>,
        bus: Arc<dyn MessageBus>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> Result<()> {
        let mut intents = bus.subscribe_intents().await?;

        if !self.reconcile_until_ready(&mut shutdown_rx).await {
            info!("Connector manager shutting down before reconcile completed");
            return Ok(());
        }

        info!("Connector manager listening for control intents");

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Connector manager shutting down");
                    return Ok(());
                }

                intent = intents.recv() => {
                    match intent {
                        Some(intent) => {
                            self.handle_intent(&intent).await;
                        }
                        None => {
                            error!("Control bus subscription closed");
                            return Err(Error::ControlBusClosed);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use feed_connector::FeedStatus;
    use ledger::{MemoryBus, MemoryLedger};
    use parking_lot::Mutex;
    use std::collections::BTreeSet;

    /// Feed that records effective upstream calls.
    #[derive(Default)]
    pub(crate) struct RecordingFeed {
        pub subscribed: Mutex<BTreeSet<Symbol>>,
        pub calls: Mutex<Vec<(&'static str, Symbol)>>,
    }

    impl UpstreamFeed for RecordingFeed {
        fn subscribe(&self, symbol: &Symbol) -> bool {
            let added = self.subscribed.lock().insert(symbol.clone());
            if added {
                self.calls.lock().push(("subscribe", symbol.clone()));
            }
            added
        }

        fn unsubscribe(&self, symbol: &Symbol) -> bool {
            let removed = self.subscribed.lock().remove(symbol);
            if removed {
                self.calls.lock().push(("unsubscribe", symbol.clone()));
            }
            removed
        }

        fn is_subscribed(&self, symbol: &Symbol) -> bool {
            self.subscribed.lock().contains(symbol)
        }

        fn status(&self) -> FeedStatus {
            FeedStatus {
                connected: true,
                subscribed_symbols: self.subscribed.lock().iter().cloned().collect(),
                reconnect_attempts: 0,
                last_pong_at: None,
            }
        }
    }

    fn setup() -> (Arc<MemoryLedger>, Arc<RecordingFeed>, ConnectorManager) {
        let ledger = Arc::new(MemoryLedger::new());
        let feed = Arc::new(RecordingFeed::default());
        let manager = ConnectorManager::new(ledger.clone(), feed.clone(), 2, Duration::from_millis(1));
        (ledger, feed, manager)
    }

    fn sub(symbol: &str, gateway: &str) -> ControlIntent {
        ControlIntent::subscribe(Symbol::new(symbol), gateway)
    }

    fn unsub(symbol: &str, gateway: &str) -> ControlIntent {
        ControlIntent::unsubscribe(Symbol::new(symbol), gateway)
    }

    #[tokio::test]
    async fn test_first_in_subscribes_last_out_unsubscribes() {
        let (_ledger, feed, manager) = setup();

        assert_eq!(manager.handle_intent(&sub("AAPL", "g1")).await, Decision::SubscribedUpstream);
        assert_eq!(manager.handle_intent(&sub("AAPL", "g2")).await, Decision::NoChange);
        assert_eq!(manager.handle_intent(&unsub("AAPL", "g1")).await, Decision::NoChange);
        assert!(feed.is_subscribed(&Symbol::new("AAPL")));
        assert_eq!(
            manager.handle_intent(&unsub("AAPL", "g2")).await,
            Decision::UnsubscribedUpstream
        );

        assert_eq!(
            *feed.calls.lock(),
            vec![
                ("subscribe", Symbol::new("AAPL")),
                ("unsubscribe", Symbol::new("AAPL")),
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_from_same_gateway_counts_once() {
        let (ledger, feed, manager) = setup();

        manager.handle_intent(&sub("TSLA", "g1")).await;
        assert_eq!(manager.handle_intent(&sub("tsla", "g1")).await, Decision::NoChange);
        assert_eq!(ledger.subscriber_count(&Symbol::new("TSLA")).await.unwrap(), 1);
        assert_eq!(feed.calls.lock().len(), 1);

        assert_eq!(
            manager.handle_intent(&unsub("TSLA", "g1")).await,
            Decision::UnsubscribedUpstream
        );
        assert!(ledger.symbols().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ledger_outage_errs_toward_subscribed() {
        let (ledger, feed, manager) = setup();
        let symbol = Symbol::new("NVDA");

        ledger.set_unavailable(true);
        assert_eq!(manager.handle_intent(&sub("NVDA", "g1")).await, Decision::SubscribedUpstream);
        assert_eq!(manager.handle_intent(&unsub("NVDA", "g1")).await, Decision::NoChange);
        assert!(feed.is_subscribed(&symbol));

        ledger.set_unavailable(false);
        manager.handle_intent(&sub("NVDA", "g1")).await;
        assert_eq!(
            manager.handle_intent(&unsub("NVDA", "g1")).await,
            Decision::UnsubscribedUpstream
        );
        assert!(!feed.is_subscribed(&symbol));
    }

    #[tokio::test]
    async fn test_reconcile_restores_and_collects() {
        let (ledger, feed, manager) = setup();
        ledger.add_gateway(&Symbol::new("AAPL"), "g1").await.unwrap();
        ledger.add_gateway(&Symbol::new("MSFT"), "g2").await.unwrap();
        ledger.add_gateway(&Symbol::new("AMZN"), "g3").await.unwrap();
        ledger.insert_empty(Symbol::new("GOOG"));

        let report = manager.reconcile().await.unwrap();
        assert_eq!(
            report.restored,
            vec![Symbol::new("AAPL"), Symbol::new("AMZN"), Symbol::new("MSFT")]
        );
        assert_eq!(report.collected, vec![Symbol::new("GOOG")]);
        assert_eq!(feed.status().subscribed_symbols.len(), 3);
        assert!(!ledger.symbols().await.unwrap().contains(&Symbol::new("GOOG")));
    }

    #[tokio::test]
    async fn test_ledger_and_upstream_agree_after_interleaved_intents() {
        let (ledger, feed, manager) = setup();
        let steps = [
            sub("AAPL", "g1"),
            sub("TSLA", "g2"),
            sub("AAPL", "g2"),
            unsub("AAPL", "g1"),
            sub("MSFT", "g1"),
            unsub("TSLA", "g2"),
            unsub("AAPL", "g2"),
            sub("TSLA", "g1"),
            unsub("MSFT", "g3"),
        ];

        for step in &steps {
            manager.handle_intent(step).await;
            for symbol in ["AAPL", "TSLA", "MSFT"].map(Symbol::new) {
                assert_eq!(
                    feed.is_subscribed(&symbol),
                    ledger.has_subscribers(&symbol).await.unwrap(),
                    "divergence on {} after {:?}",
                    symbol,
                    step
                );
            }
        }
    }

    #[tokio::test]
    async fn test_run_consumes_bus_until_shutdown() {
        let (ledger, feed, manager) = setup();
        ledger.add_gateway(&Symbol::new("IBM"), "g9").await.unwrap();

        let bus = Arc::new(MemoryBus::new());
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(Arc::new(manager).run(bus.clone(), shutdown_rx));

        // The intent subscription exists once reconcile has restored IBM.
        tokio::time::timeout(Duration::from_secs(5), async {
            while !feed.is_subscribed(&Symbol::new("IBM")) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        bus.publish_intent(&sub("AAPL", "g1")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !feed.is_subscribed(&Symbol::new("AAPL")) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(()).await.unwrap();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_run_retries_reconcile_while_ledger_unavailable() {
        let (ledger, feed, manager) = setup();
        let ibm = Symbol::new("IBM");
        ledger.add_gateway(&ibm, "g9").await.unwrap();
        ledger.set_unavailable(true);

        let bus = Arc::new(MemoryBus::new());
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(Arc::new(manager).run(bus.clone(), shutdown_rx));

        // Intents published during the outage wait for the reconcile pass.
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.publish_intent(&sub("AAPL", "g1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!feed.is_subscribed(&ibm));
        assert!(!feed.is_subscribed(&Symbol::new("AAPL")));
        assert!(!handle.is_finished());

        ledger.set_unavailable(false);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !(feed.is_subscribed(&ibm) && feed.is_subscribed(&Symbol::new("AAPL"))) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(()).await.unwrap();
        assert!(handle.await.unwrap().is_ok());
    }

    /// Bus whose control subscription is already closed.
    struct ClosedBus;

    #[async_trait::async_trait]
    impl MessageBus for ClosedBus {
        async fn publish_intent(&self, _intent: &ControlIntent) -> ledger::Result<()> {
            Ok(())
        }

        async fn publish_trades(&self, _batch: &common::TradeBatch) -> ledger::Result<()> {
            Ok(())
        }

        async fn subscribe_intents(&self) -> ledger::Result<mpsc::Receiver<ControlIntent>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        async fn subscribe_trades(&self) -> ledger::Result<mpsc::Receiver<common::TradeBatch>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn test_run_fails_when_control_bus_closes() {
        let (_ledger, _feed, manager) = setup();
        let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            Arc::new(manager).run(Arc::new(ClosedBus), shutdown_rx),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(Error::ControlBusClosed)));
    }

    #[tokio::test]
    async fn test_shutdown_during_failing_reconcile() {
        let (ledger, _feed, manager) = setup();
        ledger.set_unavailable(true);

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(Arc::new(manager).run(Arc::new(MemoryBus::new()), shutdown_rx));
        tokio::time::sleep(Duration::from_millis(20)).await;

        shutdown_tx.send(()).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap();
        assert!(result.unwrap().is_ok());
    }
}
