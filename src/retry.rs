//! Bounded retry with a fixed delay between attempts.
//!
//! Outbound calls to the table API are wrapped in a [`RetryPolicy`]. Every
//! failed attempt is logged at warning severity; once the attempt budget is
//! spent the last error is returned with a "maximum retries reached" context.
//! Tests use [`RetryPolicy::immediate`] to skip the sleep.

use anyhow::{anyhow, Result};
use std::future::Future;
use std::time::Duration;

use crate::config::SourceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Always >= 1.
    pub max_attempts: u32,
    /// Pause between consecutive attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// A policy that retries without sleeping.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_secs(config.retry_delay_secs),
        )
    }

    /// Run `op` until it succeeds or the attempt budget is exhausted.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_err = None;

        for attempt in 1..=self.max_attempts {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::warn!(
                        stage = "transport",
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "{} failed",
                        label
                    );
                    last_err = Some(e);
                }
            }

            if attempt < self.max_attempts && !self.delay.is_zero() {
                tracing::debug!("retrying {} in {:?}", label, self.delay);
                tokio::time::sleep(self.delay).await;
            }
        }

        tracing::error!(stage = "transport", "{}: maximum retries reached", label);
        let err = last_err.unwrap_or_else(|| anyhow!("no attempts were made"));
        Err(err.context(format!(
            "{}: maximum retries reached after {} attempts",
            label, self.max_attempts
        )))
    }
}
