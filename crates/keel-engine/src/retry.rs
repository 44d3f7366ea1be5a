//! Exponential backoff with jitter, shared by the reconciler and the executor.

use keel_core::BackoffConfig;
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    config: BackoffConfig,
}

impl RetryPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.config.max_attempts
    }

    /// Delay after failed attempt `attempt` (1-based), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let ms = (self.config.base_ms as f64 * self.config.multiplier.powi(exp))
            .min(self.config.max_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Delay with `jitter` applied either way, capped at `max_ms`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let spread = base * self.config.jitter;
        let jittered = if spread > 0.0 {
            base + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            base
        };
        Duration::from_millis(jittered.clamp(0.0, self.config.max_ms as f64) as u64)
    }

    /// Sleep out the backoff for `attempt`. Returns false when cancelled first.
    pub async fn pause(&self, attempt: u32, cancel: &CancellationToken) -> bool {
        let delay = self.delay(attempt);
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off");
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.cancelled() => false,
        }
    }
}
