//! In-process ledger and bus for tests and single-node runs.

use crate::error::{Error, Result};
use crate::redis_client::BUS_CHANNEL_CAPACITY;
use crate::traits::{MembershipChange, MessageBus, SubscriptionLedger};
use async_trait::async_trait;
use common::{ControlIntent, Symbol, TradeBatch};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Ledger kept in a mutex-guarded map. Each operation holds the lock for its
/// whole read-modify-read, which gives the same atomicity as the Redis scripts.
#[derive(Default)]
pub struct MemoryLedger {
    sets: Mutex<HashMap<Symbol, HashSet<String>>>,
    heartbeat: Mutex<Option<String>>,
    unavailable: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`Error::Unavailable`] until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Create an entry with no members, as an interrupted writer can leave behind.
    pub fn insert_empty(&self, symbol: Symbol) {
        self.sets.lock().entry(symbol).or_default();
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SubscriptionLedger for MemoryLedger {
    async fn add_gateway(&self, symbol: &Symbol, gateway_id: &str) -> Result<MembershipChange> {
        self.check()?;
        let mut sets = self.sets.lock();
        let set = sets.entry(symbol.clone()).or_default();
        let changed = set.insert(gateway_id.to_string());
        Ok(MembershipChange {
            changed,
            members: set.len(),
        })
    }

    async fn remove_gateway(&self, symbol: &Symbol, gateway_id: &str) -> Result<MembershipChange> {
        self.check()?;
        let mut sets = self.sets.lock();
        let (changed, members) = match sets.get_mut(symbol) {
            Some(set) => (set.remove(gateway_id), set.len()),
            None => (false, 0),
        };
        if members == 0 {
            sets.remove(symbol);
        }
        Ok(MembershipChange { changed, members })
    }

    async fn subscriber_count(&self, symbol: &Symbol) -> Result<usize> {
        self.check()?;
        Ok(self.sets.lock().get(symbol).map_or(0, HashSet::len))
    }

    async fn subscribers(&self, symbol: &Symbol) -> Result<Vec<String>> {
        self.check()?;
        let mut members: Vec<String> = self
            .sets
            .lock()
            .get(symbol)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn symbols(&self) -> Result<Vec<Symbol>> {
        self.check()?;
        Ok(self.sets.lock().keys().cloned().collect())
    }

    async fn remove_symbol(&self, symbol: &Symbol) -> Result<()> {
        self.check()?;
        self.sets.lock().remove(symbol);
        Ok(())
    }

    async fn clear_all(&self) -> Result<usize> {
        self.check()?;
        let mut sets = self.sets.lock();
        let count = sets.len();
        sets.clear();
        Ok(count)
    }

    async fn write_heartbeat(&self, payload: &str, _ttl: Duration) -> Result<()> {
        self.check()?;
        *self.heartbeat.lock() = Some(payload.to_string());
        Ok(())
    }

    async fn read_heartbeat(&self) -> Result<Option<String>> {
        self.check()?;
        Ok(self.heartbeat.lock().clone())
    }
}

/// Fan-out bus over tokio channels. Published messages reach every receiver
/// that exists at publish time; receivers that are full or gone miss it.
#[derive(Default)]
pub struct MemoryBus {
    intent_subscribers: Mutex<Vec<mpsc::Sender<ControlIntent>>>,
    trade_subscribers: Mutex<Vec<mpsc::Sender<TradeBatch>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

fn fan_out<T: Clone>(subscribers: &Mutex<Vec<mpsc::Sender<T>>>, item: &T) {
    let mut subscribers = subscribers.lock();
    subscribers.retain(|tx| !tx.is_closed());
    for tx in subscribers.iter() {
        if tx.try_send(item.clone()).is_err() {
            tracing::warn!("Bus subscriber lagging, message dropped");
        }
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish_intent(&self, intent: &ControlIntent) -> Result<()> {
        fan_out(&self.intent_subscribers, intent);
        Ok(())
    }

    async fn publish_trades(&self, batch: &TradeBatch) -> Result<()> {
        fan_out(&self.trade_subscribers, batch);
        Ok(())
    }

    async fn subscribe_intents(&self) -> Result<mpsc::Receiver<ControlIntent>> {
        let (tx, rx) = mpsc::channel(BUS_CHANNEL_CAPACITY);
        self.intent_subscribers.lock().push(tx);
        Ok(rx)
    }

    async fn subscribe_trades(&self) -> Result<mpsc::Receiver<TradeBatch>> {
        let (tx, rx) = mpsc::channel(BUS_CHANNEL_CAPACITY);
        self.trade_subscribers.lock().push(tx);
        Ok(rx)
    }
}
