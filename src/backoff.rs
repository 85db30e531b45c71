//! # Exponential Backoff
//!
//! Stateful delay calculator for one logical retry sequence:
//! `delay = min(base * multiplier^attempt, max)`, with optional symmetric
//! ±25% jitter to avoid thundering-herd retries against a recovering
//! upstream.

use std::future::Future;
use std::time::{Duration, Instant};

use metrics::histogram;
use rand::{Rng, thread_rng};
use tokio::time::sleep;

use crate::config::{BackoffConfig, ConfigError};

/// Jitter spread applied around the computed delay when enabled.
const JITTER_SPREAD: f64 = 0.25;

/// Per-sequence retry state. Create one per retry loop (or `reset` between
/// loops); `next_delay` advances the attempt counter.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
    started_at: Instant,
}

impl ExponentialBackoff {
    /// Build a backoff sequence, validating the configuration.
    pub fn new(config: BackoffConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            attempt: 0,
            started_at: Instant::now(),
        })
    }

    /// Zero the attempt counter and restart the elapsed-time clock.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.started_at = Instant::now();
    }

    /// Retries consumed so far in this sequence.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Wall time since the sequence started (or was last reset).
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// True while retry budget remains.
    pub fn should_retry(&self) -> bool {
        self.attempt < self.config.max_attempts
    }

    /// Compute the next delay and consume one attempt. Returns `None` once
    /// the budget is exhausted; calling past exhaustion is not an error.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        let raw = self.config.base_delay_ms as f64 * self.config.multiplier.powi(self.attempt as i32);
        let capped = raw.min(self.config.max_delay_ms as f64);
        self.attempt += 1;

        let delay_ms = if self.config.jitter {
            let factor = thread_rng().gen_range(1.0 - JITTER_SPREAD..=1.0 + JITTER_SPREAD);
            (capped * factor).max(0.0)
        } else {
            capped
        };

        let delay = Duration::from_millis(delay_ms.round() as u64);
        histogram!("sync_retry_backoff_seconds").record(delay.as_secs_f64());
        Some(delay)
    }

    /// Run `op` until it succeeds or the retry budget is exhausted,
    /// sleeping the computed delay between attempts. The last error is
    /// propagated on exhaustion.
    pub async fn execute<T, E, F, Fut>(&mut self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with_hook(op, |_, _, _| {}).await
    }

    /// As [`execute`](Self::execute), invoking `on_retry(attempt, error,
    /// delay)` before each sleep.
    pub async fn execute_with_hook<T, E, F, Fut, H>(&mut self, mut op: F, mut on_retry: H) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        H: FnMut(u32, &E, Duration),
    {
        self.reset();
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => match self.next_delay() {
                    Some(delay) => {
                        on_retry(self.attempt, &err, delay);
                        sleep(delay).await;
                    }
                    None => return Err(err),
                },
            }
        }
    }
}
