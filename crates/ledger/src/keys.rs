//! Key and channel naming shared by every process.

use common::Symbol;

/// Per-symbol set of gateway ids: `ws:symbols:{SYMBOL}`.
pub const SYMBOL_KEY_PREFIX: &str = "ws:symbols:";

/// Control bus carrying gateway subscribe/unsubscribe intents.
pub const CONTROL_CHANNEL: &str = "feed:control";

/// Per-symbol trade channel: `trade:{SYMBOL}`.
pub const TRADE_CHANNEL_PREFIX: &str = "trade:";

/// Pattern matching every trade channel.
pub const TRADE_CHANNEL_PATTERN: &str = "trade:*";

/// Connector manager heartbeat snapshot.
pub const HEARTBEAT_KEY: &str = "feed:manager:heartbeat";

pub fn symbol_key(symbol: &Symbol) -> String {
    format!("{}{}", SYMBOL_KEY_PREFIX, symbol)
}

/// Recover the symbol from a ledger key. Returns None for foreign keys.
pub fn symbol_from_key(key: &str) -> Option<Symbol> {
    key.strip_prefix(SYMBOL_KEY_PREFIX)
        .filter(|s| !s.is_empty())
        .map(Symbol::new)
}

pub fn trade_channel(symbol: &Symbol) -> String {
    format!("{}{}", TRADE_CHANNEL_PREFIX, symbol)
}

/// Recover the symbol from a trade channel name.
///
/// Provider symbols may themselves contain `:` (e.g. `BINANCE:BTCUSDT`), so
/// everything after the prefix is the symbol.
pub fn symbol_from_trade_channel(channel: &str) -> Option<Symbol> {
    channel
        .strip_prefix(TRADE_CHANNEL_PREFIX)
        .filter(|s| !s.is_empty())
        .map(Symbol::new)
}
