//! Upstream feed connection settings.

use crate::error::{Error, Result};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Base WebSocket URL of the provider (`ws://` or `wss://`).
    pub url: String,
    /// Provider token, sent as the `token` query parameter.
    pub api_key: Option<String>,
    /// Interval between liveness pings.
    pub ping_interval: Duration,
    /// Extra grace after a missed ping before the socket is considered stale.
    pub pong_timeout: Duration,
    /// Upper bound for DNS + TCP + TLS + WebSocket handshake.
    pub connect_timeout: Duration,
    /// First reconnect delay.
    pub reconnect_delay: Duration,
    /// Reconnect delay cap.
    pub max_reconnect_delay: Duration,
    /// Consecutive failed attempts after which the connector gives up.
    pub max_reconnect_attempts: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "wss://ws.finnhub.io".to_string(),
            api_key: None,
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_millis(1000),
            max_reconnect_delay: Duration::from_millis(30_000),
            max_reconnect_attempts: 10,
        }
    }
}

impl FeedConfig {
    /// Full endpoint including the token.
    pub fn endpoint(&self) -> Result<Url> {
        let mut url = Url::parse(&self.url)?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(Error::InvalidUrl(format!("unsupported scheme {}", other))),
        }
        if url.host_str().is_none() {
            return Err(Error::InvalidUrl("no host".to_string()));
        }
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            url.query_pairs_mut().append_pair("token", key);
        }
        Ok(url)
    }

    /// Endpoint safe for logs.
    pub fn redacted_endpoint(&self) -> String {
        match self.endpoint() {
            Ok(mut url) if self.api_key.is_some() => {
                let pairs: Vec<(String, String)> = url
                    .query_pairs()
                    .map(|(k, v)| {
                        let v = if k == "token" { "****".to_string() } else { v.into_owned() };
                        (k.into_owned(), v)
                    })
                    .collect();
                url.query_pairs_mut().clear().extend_pairs(pairs);
                url.to_string()
            }
            Ok(url) => url.to_string(),
            Err(_) => self.url.clone(),
        }
    }

    /// Silence after which the connection is declared stale.
    pub fn stale_after(&self) -> Duration {
        self.ping_interval + self.pong_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_appends_token() {
        let config = FeedConfig {
            api_key: Some("abc123".to_string()),
            ..Default::default()
        };
        let url = config.endpoint().unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.host_str(), Some("ws.finnhub.io"));
        assert_eq!(url.query(), Some("token=abc123"));
        assert!(!config.redacted_endpoint().contains("abc123"));
        assert!(config.redacted_endpoint().contains("token=****"));
    }

    #[test]
    fn test_endpoint_rejects_http() {
        let config = FeedConfig {
            url: "https://ws.finnhub.io".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.endpoint(), Err(Error::InvalidUrl(_))));
    }

    #[test]
    fn test_stale_after_is_interval_plus_timeout() {
        assert_eq!(FeedConfig::default().stale_after(), Duration::from_secs(40));
    }
}
