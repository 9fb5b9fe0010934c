//! Exponential backoff and bounded retry.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Exponential backoff with a cap: `min(base * 2^(attempt - 1), max)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Advance the attempt counter and return the delay for it.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let factor = 2u32.saturating_pow(self.attempt - 1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Run `op` up to `attempts` times, sleeping with `backoff` between failures.
///
/// Returns the last error once every attempt has failed.
pub async fn retry_with_backoff<T, E, F, Fut>(
    label: &str,
    attempts: u32,
    mut backoff: Backoff,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = attempts.max(1);
    let mut tried = 0;

    loop {
        tried += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if tried >= attempts => return Err(e),
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    "{} failed (attempt {}/{}): {}, retrying in {:?}",
                    label, tried, attempts, e, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
