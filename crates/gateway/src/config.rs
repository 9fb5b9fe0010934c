//! Gateway configuration, read from the environment.

use crate::error::Result;
use common::env::{env_or, env_parse};
use ledger::LedgerConfig;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Identifier published in every control intent.
    pub server_id: String,
    pub port: u16,
    pub redis_url: String,
    pub max_symbols_per_connection: usize,
    pub heartbeat_interval: Duration,
    pub stats_interval: Duration,
    pub metrics_port: u16,
    pub ledger: LedgerConfig,
    pub intent_retry_attempts: u32,
    pub intent_retry_delay: Duration,
}

/// `ws-gateway-` followed by the first 8 hex digits of a random uuid.
pub fn default_server_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("ws-gateway-{}", &id[..8])
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server_id: default_server_id(),
            port: 8080,
            redis_url: "redis://localhost:6379".to_string(),
            max_symbols_per_connection: 5,
            heartbeat_interval: Duration::from_secs(30),
            stats_interval: Duration::from_secs(60),
            metrics_port: 9093,
            ledger: LedgerConfig::default(),
            intent_retry_attempts: 3,
            intent_retry_delay: Duration::from_millis(100),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let ledger = LedgerConfig {
            op_timeout: Duration::from_millis(env_parse(
                "LEDGER_TIMEOUT_MS",
                defaults.ledger.op_timeout.as_millis() as u64,
            )?),
            ..defaults.ledger.clone()
        };

        Ok(Self {
            server_id: env_or("GATEWAY_ID", &defaults.server_id),
            port: env_parse("WS_PORT", defaults.port)?,
            redis_url: env_or("REDIS_URL", &defaults.redis_url),
            max_symbols_per_connection: env_parse(
                "MAX_SYMBOLS_PER_CONNECTION",
                defaults.max_symbols_per_connection,
            )?,
            heartbeat_interval: Duration::from_secs(env_parse(
                "HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval.as_secs(),
            )?),
            stats_interval: Duration::from_secs(env_parse(
                "STATS_INTERVAL_SECS",
                defaults.stats_interval.as_secs(),
            )?),
            metrics_port: env_parse("METRICS_PORT", defaults.metrics_port)?,
            ledger,
            intent_retry_attempts: defaults.intent_retry_attempts,
            intent_retry_delay: defaults.intent_retry_delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_server_id_shape() {
        let id = default_server_id();
        let suffix = id.strip_prefix("ws-gateway-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, default_server_id());
    }
}
