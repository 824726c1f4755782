use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::settings::JudgeSettings;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, the first call included.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            backoff_multiplier: 2.0,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryConfig {
    pub fn from_settings(settings: &JudgeSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_delay_ms: settings.initial_backoff_ms,
            backoff_multiplier: settings.backoff_multiplier,
            max_delay_ms: settings.max_backoff_ms,
        }
    }

    /// Delay after the given failed attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(base.min(self.max_delay_ms as f64) as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClassification {
    Retry,
    NoRetry,
    RateLimited { retry_after_ms: Option<u64> },
}

pub trait RetryableError {
    fn classify(&self) -> RetryClassification;
}

pub async fn with_retry<T, E, F, Fut>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    E: RetryableError + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let classification = err.classify();
        if classification == RetryClassification::NoRetry {
            debug!(
                operation = operation_name,
                attempt = attempt + 1,
                error = %err,
                "Non-retryable failure"
            );
            return Err(err);
        }

        if attempt + 1 >= config.max_attempts {
            warn!(
                operation = operation_name,
                attempts = config.max_attempts,
                error = %err,
                "Retry attempts exhausted"
            );
            return Err(err);
        }

        let delay = match classification {
            RetryClassification::RateLimited {
                retry_after_ms: Some(ms),
            } => Duration::from_millis(ms.min(config.max_delay_ms)),
            _ => config.delay_for_attempt(attempt),
        };

        warn!(
            operation = operation_name,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Attempt failed, retrying"
        );
        sleep(delay).await;
        attempt += 1;
    }
}
