//! Common types shared by the market-data fan-out services.
//!
//! - [`Symbol`]: canonical uppercase ticker
//! - [`ControlIntent`]: gateway → connector manager subscribe/unsubscribe intent
//! - [`TradeBatch`] / [`TradeData`]: per-symbol trade payloads on the fan-out channels
//! - [`Backoff`] / [`retry_with_backoff`]: shared reconnect and retry policy
//! - [`env`]: typed environment-variable configuration

pub mod backoff;
pub mod env;
pub mod messages;
pub mod symbol;

pub use backoff::{retry_with_backoff, Backoff};
pub use messages::{ControlIntent, IntentAction, TradeBatch, TradeData};
pub use symbol::Symbol;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
