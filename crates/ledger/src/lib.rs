//! Shared subscription ledger and message bus.
//!
//! The ledger records, per symbol, which gateway processes currently need it.
//! The connector manager reads membership transitions from it to decide when
//! the single upstream subscription should be opened or closed.
//!
//! - [`RedisLedger`]: production backend (atomic Lua scripts, pub/sub)
//! - [`MemoryLedger`] / [`MemoryBus`]: in-process backends

pub mod error;
pub mod keys;
pub mod memory;
pub mod redis_client;
pub mod traits;

pub use error::{Error, Result};
pub use memory::{MemoryBus, MemoryLedger};
pub use redis_client::{LedgerConfig, RedisLedger};
pub use traits::{LedgerStats, MembershipChange, MessageBus, SubscriptionLedger, SymbolStat};
