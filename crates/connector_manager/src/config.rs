//! Connector manager configuration, read from the environment.

use crate::error::Result;
use common::env::{env_opt, env_or, env_parse};
use feed_connector::FeedConfig;
use ledger::LedgerConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub redis_url: String,
    pub feed: FeedConfig,
    pub ledger: LedgerConfig,
    /// How often the heartbeat snapshot is written.
    pub heartbeat_interval: Duration,
    /// Expiry of the heartbeat key.
    pub heartbeat_ttl: Duration,
    /// Attempts per ledger call before the fallback rule applies.
    pub ledger_retry_attempts: u32,
    pub ledger_retry_delay: Duration,
    pub metrics_port: u16,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            feed: FeedConfig::default(),
            ledger: LedgerConfig::default(),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_ttl: Duration::from_secs(30),
            ledger_retry_attempts: 3,
            ledger_retry_delay: Duration::from_millis(100),
            metrics_port: 9094,
        }
    }
}

impl ManagerConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let feed_defaults = &defaults.feed;

        let feed = FeedConfig {
            url: env_or("FEED_URL", &feed_defaults.url),
            api_key: env_opt("FEED_API_KEY"),
            ping_interval: Duration::from_secs(env_parse(
                "FEED_PING_INTERVAL_SECS",
                feed_defaults.ping_interval.as_secs(),
            )?),
            pong_timeout: Duration::from_secs(env_parse(
                "FEED_PONG_TIMEOUT_SECS",
                feed_defaults.pong_timeout.as_secs(),
            )?),
            connect_timeout: Duration::from_secs(env_parse(
                "FEED_CONNECT_TIMEOUT_SECS",
                feed_defaults.connect_timeout.as_secs(),
            )?),
            reconnect_delay: Duration::from_millis(env_parse(
                "FEED_RECONNECT_DELAY_MS",
                feed_defaults.reconnect_delay.as_millis() as u64,
            )?),
            max_reconnect_delay: Duration::from_millis(env_parse(
                "FEED_MAX_RECONNECT_DELAY_MS",
                feed_defaults.max_reconnect_delay.as_millis() as u64,
            )?),
            max_reconnect_attempts: env_parse(
                "FEED_MAX_RECONNECT_ATTEMPTS",
                feed_defaults.max_reconnect_attempts,
            )?,
        };

        let ledger = LedgerConfig {
            key_ttl: Duration::from_secs(env_parse(
                "LEDGER_TTL_SECS",
                defaults.ledger.key_ttl.as_secs(),
            )?),
            op_timeout: Duration::from_millis(env_parse(
                "LEDGER_TIMEOUT_MS",
                defaults.ledger.op_timeout.as_millis() as u64,
            )?),
            ..defaults.ledger.clone()
        };

        Ok(Self {
            redis_url: env_or("REDIS_URL", &defaults.redis_url),
            feed,
            ledger,
            heartbeat_interval: Duration::from_secs(env_parse(
                "HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval.as_secs(),
            )?),
            heartbeat_ttl: Duration::from_secs(env_parse(
                "HEARTBEAT_TTL_SECS",
                defaults.heartbeat_ttl.as_secs(),
            )?),
            metrics_port: env_parse("METRICS_PORT", defaults.metrics_port)?,
            ..defaults
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = ManagerConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.heartbeat_ttl, Duration::from_secs(30));
        assert_eq!(config.ledger.key_ttl, Duration::from_secs(86_400));
        assert_eq!(config.feed.max_reconnect_attempts, 10);
        assert_eq!(config.metrics_port, 9094);
    }
}
