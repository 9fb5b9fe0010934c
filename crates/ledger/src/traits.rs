//! Seams between the services and the shared broker.

use crate::error::Result;
use async_trait::async_trait;
use common::{ControlIntent, Symbol, TradeBatch};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// Outcome of one atomic set mutation on a symbol's ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipChange {
    /// Whether the set actually changed (the id was added or removed).
    pub changed: bool,
    /// Set cardinality observed inside the same atomic step.
    pub members: usize,
}

impl MembershipChange {
    /// True when the caller's gateway is now the only member (0 → 1 on add).
    pub fn is_sole_member(&self) -> bool {
        self.members == 1
    }

    /// True when no gateway wants the symbol any more (1 → 0 on remove).
    pub fn is_empty(&self) -> bool {
        self.members == 0
    }
}

/// Subscriber count for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolStat {
    pub symbol: Symbol,
    pub subscriber_count: usize,
}

/// Ledger-wide statistics for the heartbeat snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStats {
    pub total_symbols: usize,
    pub symbol_stats: Vec<SymbolStat>,
}

/// Shared per-symbol record of which gateway processes need the symbol.
///
/// `add_gateway` and `remove_gateway` must each be a single atomic step on the
/// backing store: two gateways adding themselves concurrently are both
/// reflected, and exactly one of them observes a cardinality of 1.
#[async_trait]
pub trait SubscriptionLedger: Send + Sync + 'static {
    /// Add `gateway_id` to the symbol's set, refresh its expiry, and read the cardinality.
    async fn add_gateway(&self, symbol: &Symbol, gateway_id: &str) -> Result<MembershipChange>;

    /// Remove `gateway_id` from the symbol's set and delete the entry once empty.
    async fn remove_gateway(&self, symbol: &Symbol, gateway_id: &str) -> Result<MembershipChange>;

    async fn subscriber_count(&self, symbol: &Symbol) -> Result<usize>;

    async fn subscribers(&self, symbol: &Symbol) -> Result<Vec<String>>;

    /// Every symbol with a ledger entry, empty or not.
    async fn symbols(&self) -> Result<Vec<Symbol>>;

    /// Drop a symbol's entry regardless of its members.
    async fn remove_symbol(&self, symbol: &Symbol) -> Result<()>;

    /// Drop every symbol entry. Returns the number of entries removed.
    async fn clear_all(&self) -> Result<usize>;

    async fn write_heartbeat(&self, payload: &str, ttl: Duration) -> Result<()>;

    async fn read_heartbeat(&self) -> Result<Option<String>>;

    async fn has_subscribers(&self, symbol: &Symbol) -> Result<bool> {
        Ok(self.subscriber_count(symbol).await? > 0)
    }

    async fn stats(&self) -> Result<LedgerStats> {
        let mut symbols = self.symbols().await?;
        symbols.sort();

        let mut symbol_stats = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let subscriber_count = self.subscriber_count(&symbol).await?;
            symbol_stats.push(SymbolStat {
                symbol,
                subscriber_count,
            });
        }

        Ok(LedgerStats {
            total_symbols: symbol_stats.len(),
            symbol_stats,
        })
    }

    /// Remove a departed gateway from every symbol.
    ///
    /// Returns the symbols whose sets became empty, i.e. the ones the upstream
    /// should stop streaming.
    async fn cleanup_gateway(&self, gateway_id: &str) -> Result<Vec<Symbol>> {
        let mut emptied = Vec::new();
        for symbol in self.symbols().await? {
            let members = self.subscribers(&symbol).await?;
            if !members.iter().any(|m| m == gateway_id) {
                continue;
            }
            if self.remove_gateway(&symbol, gateway_id).await?.is_empty() {
                emptied.push(symbol);
            }
        }
        emptied.sort();
        Ok(emptied)
    }
}

/// Broadcast transport for control intents and trade batches.
///
/// Subscriptions are live once the returned receiver exists; messages published
/// before that are not replayed.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    async fn publish_intent(&self, intent: &ControlIntent) -> Result<()>;

    /// Publish one symbol's batch on its `trade:{SYMBOL}` channel.
    async fn publish_trades(&self, batch: &TradeBatch) -> Result<()>;

    async fn subscribe_intents(&self) -> Result<mpsc::Receiver<ControlIntent>>;

    /// Pattern-subscribe to every trade channel.
    async fn subscribe_trades(&self) -> Result<mpsc::Receiver<TradeBatch>>;
}
