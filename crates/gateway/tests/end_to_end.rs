//! Client → gateway → control bus → connector manager → feed → gateway → client,
//! wired over the in-process ledger and bus.

use axum::extract::ws::Message;
use common::{ControlIntent, IntentAction, Symbol};
use connector_manager::{ConnectorManager, Decision};
use feed_connector::{FeedConfig, FeedConnector, UpstreamFeed};
use gateway::{GatewayService, IntentPublisher, IntentQueue, TradeRouter};
use ledger::{MemoryBus, MemoryLedger, MessageBus, SubscriptionLedger};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(2);

struct Gateway {
    service: Arc<GatewayService>,
    shutdown: Vec<mpsc::Sender<()>>,
}

impl Gateway {
    async fn start(server_id: &str, bus: Arc<MemoryBus>) -> Self {
        let (intents, intent_rx) = IntentQueue::new(server_id);
        let service = Arc::new(GatewayService::new(5, intents));

        let (publisher_tx, publisher_rx) = mpsc::channel(1);
        let publisher = IntentPublisher::new(intent_rx, bus.clone(), 3, Duration::from_millis(1));
        tokio::spawn(publisher.run(publisher_rx));

        let router = TradeRouter::new(service.clone(), bus.clone());
        let trades = router.subscribe().await.unwrap();
        let (router_tx, router_rx) = mpsc::channel(1);
        tokio::spawn(async move { router.route(trades, router_rx).await });

        Self {
            service,
            shutdown: vec![publisher_tx, router_tx],
        }
    }

    async fn stop(self) {
        for tx in self.shutdown {
            let _ = tx.send(()).await;
        }
    }
}

struct Client {
    connection: Arc<gateway::ClientConnection>,
    rx: mpsc::Receiver<Message>,
}

impl Client {
    fn connect(gateway: &Gateway) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let connection = gateway.service.connect(None, tx);
        let mut client = Self { connection, rx };
        assert_eq!(client.try_next().unwrap()["type"], "success");
        client
    }

    fn try_next(&mut self) -> Option<Value> {
        match self.rx.try_recv() {
            Ok(Message::Text(text)) => Some(serde_json::from_str(text.as_str()).unwrap()),
            _ => None,
        }
    }

    async fn next(&mut self) -> Value {
        match tokio::time::timeout(WAIT, self.rx.recv()).await {
            Ok(Some(Message::Text(text))) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }
}

async fn next_intent(control: &mut mpsc::Receiver<ControlIntent>) -> ControlIntent {
    tokio::time::timeout(WAIT, control.recv())
        .await
        .expect("no intent published")
        .expect("control bus closed")
}

fn upstream_trade(symbol: &str, price: f64, timestamp: i64) -> String {
    format!(
        r#"{{"type":"trade","data":[{{"s":"{}","p":{},"t":{},"v":100}}]}}"#,
        symbol, price, timestamp
    )
}

#[tokio::test]
async fn test_single_client_trade_flow() {
    let bus = Arc::new(MemoryBus::new());
    let ledger = Arc::new(MemoryLedger::new());
    let feed = Arc::new(FeedConnector::new(FeedConfig::default(), bus.clone()));
    let manager = ConnectorManager::new(ledger.clone(), feed.clone(), 3, Duration::from_millis(1));
    let mut control = bus.subscribe_intents().await.unwrap();

    let gateway = Gateway::start("gw-e2e", bus.clone()).await;
    let aapl = Symbol::new("AAPL");

    // Client A subscribes; the manager sees the first member and subscribes upstream.
    let mut client = Client::connect(&gateway);
    gateway
        .service
        .handle_text(&client.connection, r#"{"action":"subscribe","symbols":["aapl"]}"#);
    assert_eq!(client.next().await["type"], "success");

    let intent = next_intent(&mut control).await;
    assert_eq!(intent.action, IntentAction::Subscribe);
    assert_eq!(intent.server_id, "gw-e2e");
    assert_eq!(manager.handle_intent(&intent).await, Decision::SubscribedUpstream);
    assert!(feed.is_subscribed(&aapl));
    assert_eq!(ledger.subscriber_count(&aapl).await.unwrap(), 1);

    // An upstream trade reaches the client.
    let t = 1_700_000_000_000i64;
    assert_eq!(feed.handle_upstream_text(&upstream_trade("AAPL", 150.25, t)).await.unwrap(), 1);
    let frame = client.next().await;
    assert_eq!(frame["type"], "trade");
    assert_eq!(frame["data"]["symbol"], "AAPL");
    assert_eq!(frame["data"]["price"], 150.25);
    assert_eq!(frame["data"]["volume"], 100.0);
    assert_eq!(frame["data"]["timestamp"], t);

    // Disconnect releases the symbol; the manager sees the last member leave.
    gateway.service.disconnect(&client.connection.id);
    let intent = next_intent(&mut control).await;
    assert_eq!(intent.action, IntentAction::Unsubscribe);
    assert_eq!(manager.handle_intent(&intent).await, Decision::UnsubscribedUpstream);
    assert!(!feed.is_subscribed(&aapl));
    assert!(ledger.symbols().await.unwrap().is_empty());

    // A straggling trade has nobody to go to.
    let sent_before = gateway.service.stats().messages_sent;
    feed.handle_upstream_text(&upstream_trade("AAPL", 151.0, t + 1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.try_next().is_none());
    assert_eq!(gateway.service.stats().messages_sent, sent_before);

    gateway.stop().await;
}

#[tokio::test]
async fn test_two_gateways_share_one_upstream_subscription() {
    let bus = Arc::new(MemoryBus::new());
    let ledger = Arc::new(MemoryLedger::new());
    let feed = Arc::new(FeedConnector::new(FeedConfig::default(), bus.clone()));
    let manager = ConnectorManager::new(ledger.clone(), feed.clone(), 3, Duration::from_millis(1));
    let mut control = bus.subscribe_intents().await.unwrap();

    let g1 = Gateway::start("gw-1", bus.clone()).await;
    let g2 = Gateway::start("gw-2", bus.clone()).await;
    let tsla = Symbol::new("TSLA");
    let subscribe = r#"{"action":"subscribe","symbols":["TSLA"]}"#;
    let unsubscribe = r#"{"action":"unsubscribe","symbols":["TSLA"]}"#;

    let mut c1 = Client::connect(&g1);
    let mut c2 = Client::connect(&g2);
    // Second local client on g1 does not publish another intent.
    let mut c3 = Client::connect(&g1);

    g1.service.handle_text(&c1.connection, subscribe);
    let first = manager.handle_intent(&next_intent(&mut control).await).await;
    g2.service.handle_text(&c2.connection, subscribe);
    let second = manager.handle_intent(&next_intent(&mut control).await).await;
    g1.service.handle_text(&c3.connection, subscribe);

    assert_eq!(first, Decision::SubscribedUpstream);
    assert_eq!(second, Decision::NoChange);
    assert_eq!(ledger.subscriber_count(&tsla).await.unwrap(), 2);

    // Every client on both gateways gets the trade.
    feed.handle_upstream_text(&upstream_trade("TSLA", 250.0, 1))
        .await
        .unwrap();
    for client in [&mut c1, &mut c2, &mut c3] {
        assert_eq!(client.next().await["type"], "success");
        assert_eq!(client.next().await["data"]["price"], 250.0);
    }

    // g1 keeps the symbol while c3 still holds it.
    g1.service.handle_text(&c1.connection, unsubscribe);
    g1.service.disconnect(&c3.connection.id);
    let intent = next_intent(&mut control).await;
    assert_eq!(intent.server_id, "gw-1");
    assert_eq!(manager.handle_intent(&intent).await, Decision::NoChange);
    assert!(feed.is_subscribed(&tsla));

    g2.service.handle_text(&c2.connection, unsubscribe);
    let intent = next_intent(&mut control).await;
    assert_eq!(intent.server_id, "gw-2");
    assert_eq!(manager.handle_intent(&intent).await, Decision::UnsubscribedUpstream);
    assert!(!feed.is_subscribed(&tsla));

    assert!(control.try_recv().is_err());
    g1.stop().await;
    g2.stop().await;
}
