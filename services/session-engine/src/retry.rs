//! Bounded retry with exponential backoff for collaborator calls
//!
//! Only transient errors are retried; anything else is returned on the first
//! failure.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::TradingConfig;
use crate::error::{EngineError, Result};

/// Retry configuration for transfers and swaps
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 4000,
            jitter: true,
        }
    }
}

impl From<&TradingConfig> for RetryConfig {
    fn from(config: &TradingConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay_ms: config.retry_base_delay_ms,
            max_delay_ms: config.retry_max_delay_ms,
            jitter: true,
        }
    }
}

/// Outcome of a retried operation: the value plus how many attempts it took
#[derive(Debug)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Failed retried operation: the last error plus attempts used
#[derive(Debug)]
pub struct Exhausted {
    pub error: EngineError,
    pub attempts: u32,
}

/// Calculate backoff delay with optional jitter
pub fn backoff_delay(attempt: u32, config: &RetryConfig) -> Duration {
    // base, 2x, 4x, 8x
    let delay = config.base_delay_ms.saturating_mul(1_u64 << attempt.min(3));
    let delay = delay.min(config.max_delay_ms);

    // ±25%
    let jittered = if config.jitter && delay >= 4 {
        let jitter_range = delay / 4;
        let jitter = rand::random::<u64>() % (jitter_range * 2 + 1);
        delay.saturating_sub(jitter_range) + jitter
    } else {
        delay
    };

    Duration::from_millis(jittered)
}

/// Execute a fallible async operation, retrying transient failures
pub async fn with_retry<F, Fut, T>(
    operation: F,
    config: &RetryConfig,
) -> std::result::Result<Attempted<T>, Exhausted>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                return Ok(Attempted {
                    value,
                    attempts: attempt,
                })
            }
            Err(e) if e.is_transient() && attempt < max_attempts => {
                warn!(
                    "Operation failed (attempt {}/{}): {}",
                    attempt, max_attempts, e
                );
                let delay = backoff_delay(attempt - 1, config);
                debug!("Retrying after {:?}", delay);
                sleep(delay).await;
            }
            Err(error) => {
                return Err(Exhausted {
                    error,
                    attempts: attempt,
                })
            }
        }
    }
}
