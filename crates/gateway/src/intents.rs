//! Ordered control-intent publishing.
//!
//! The registry queues intents while it still holds the index lock for the
//! symbol, and a single [`IntentPublisher`] task drains the queue onto the
//! control bus. One producer order, one consumer: the bus never sees this
//! gateway's `unsubscribe` for a symbol ahead of the `subscribe` before it.

use common::{retry_with_backoff, Backoff, ControlIntent, Symbol};
use ledger::MessageBus;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Producer side of the intent queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct IntentQueue {
    server_id: Arc<str>,
    tx: mpsc::UnboundedSender<ControlIntent>,
}

impl IntentQueue {
    pub fn new(server_id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<ControlIntent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            server_id: Arc::from(server_id.into()),
            tx,
        };
        (queue, rx)
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn subscribe(&self, symbol: &Symbol) {
        self.push(ControlIntent::subscribe(symbol.clone(), &*self.server_id));
    }

    pub fn unsubscribe(&self, symbol: &Symbol) {
        self.push(ControlIntent::unsubscribe(symbol.clone(), &*self.server_id));
    }

    fn push(&self, intent: ControlIntent) {
        if let Err(e) = self.tx.send(intent) {
            let intent = e.0;
            error!(
                "[{}] Intent queue closed, dropping {} for {}",
                self.server_id,
                intent.action.as_str(),
                intent.symbol
            );
        }
    }
}

/// Publishes queued intents one at a time, retrying transient bus failures.
pub struct IntentPublisher {
    rx: mpsc::UnboundedReceiver<ControlIntent>,
    bus: Arc<dyn MessageBus>,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl IntentPublisher {
    pub fn new(
        rx: mpsc::UnboundedReceiver<ControlIntent>,
        bus: Arc<dyn MessageBus>,
        retry_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            rx,
            bus,
            retry_attempts,
            retry_delay,
        }
    }

    /// Publish until shutdown, then drain whatever is already queued.
    pub async fn run(mut self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!("IntentPublisher running");

        loop {
            tokio::select! {
                biased;

                intent = self.rx.recv() => {
                    match intent {
                        Some(intent) => self.publish(&intent).await,
                        None => break,
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("IntentPublisher received shutdown signal");
                    break;
                }
            }
        }

        self.rx.close();
        let mut drained = 0usize;
        while let Some(intent) = self.rx.recv().await {
            self.publish(&intent).await;
            drained += 1;
        }

        info!("IntentPublisher stopped ({} intents drained)", drained);
    }

    async fn publish(&self, intent: &ControlIntent) {
        let bus = &self.bus;
        let label = format!("publish {} {}", intent.action.as_str(), intent.symbol);
        let backoff = Backoff::new(self.retry_delay, self.retry_delay.saturating_mul(8));

        match retry_with_backoff(&label, self.retry_attempts, backoff, move || {
            bus.publish_intent(intent)
        })
        .await
        {
            Ok(()) => {
                counter!("gateway_intents_published_total", "action" => intent.action.as_str())
                    .increment(1);
                debug!(
                    "[{}] Published {} intent for {}",
                    intent.server_id,
                    intent.action.as_str(),
                    intent.symbol
                );
            }
            Err(e) => {
                counter!("gateway_intent_failures_total").increment(1);
                error!(
                    "[{}] Giving up on {} intent for {}: {}",
                    intent.server_id,
                    intent.action.as_str(),
                    intent.symbol,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::IntentAction;
    use ledger::MemoryBus;

    #[tokio::test]
    async fn test_publisher_preserves_queue_order() {
        let bus = Arc::new(MemoryBus::new());
        let mut observed = bus.subscribe_intents().await.unwrap();

        let (queue, rx) = IntentQueue::new("gw-1");
        let publisher = IntentPublisher::new(rx, bus.clone(), 3, Duration::from_millis(1));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(publisher.run(shutdown_rx));

        let aapl = Symbol::new("AAPL");
        queue.subscribe(&aapl);
        queue.unsubscribe(&aapl);
        queue.subscribe(&aapl);

        let mut actions = Vec::new();
        for _ in 0..3 {
            let intent = observed.recv().await.unwrap();
            assert_eq!(intent.server_id, "gw-1");
            assert_eq!(intent.symbol, aapl);
            actions.push(intent.action);
        }
        assert_eq!(
            actions,
            vec![
                IntentAction::Subscribe,
                IntentAction::Unsubscribe,
                IntentAction::Subscribe
            ]
        );

        shutdown_tx.send(()).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_publisher_drains_on_shutdown() {
        let bus = Arc::new(MemoryBus::new());
        let mut observed = bus.subscribe_intents().await.unwrap();

        let (queue, rx) = IntentQueue::new("gw-1");
        queue.unsubscribe(&Symbol::new("TSLA"));
        queue.unsubscribe(&Symbol::new("MSFT"));

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        shutdown_tx.send(()).await.unwrap();
        IntentPublisher::new(rx, bus.clone(), 1, Duration::from_millis(1))
            .run(shutdown_rx)
            .await;

        assert_eq!(observed.recv().await.unwrap().symbol, Symbol::new("TSLA"));
        assert_eq!(observed.recv().await.unwrap().symbol, Symbol::new("MSFT"));
    }
}
