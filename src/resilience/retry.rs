// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry and backoff helpers.
//!
//! Two shapes of retry live here:
//!
//! - [`retry()`] with a [`RetryConfig`] wraps a single fallible operation
//!   (opening a storage tier) in exponential backoff.
//! - [`BackoffSchedule`] is the explicit delay table the retry queue walks
//!   as an item accumulates failed delivery attempts.
//!
//! # Example
//!
//! ```
//! use telemetry_relay::resilience::retry::BackoffSchedule;
//! use std::time::Duration;
//!
//! let schedule = BackoffSchedule::default();
//! assert_eq!(schedule.delay_for(1), Duration::from_secs(1));
//! assert_eq!(schedule.delay_for(2), Duration::from_secs(5));
//! // Past the end of the table the last delay repeats
//! assert_eq!(schedule.delay_for(99), Duration::from_secs(60));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Bounded exponential backoff for one-shot operations such as opening a tier.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts, the first one included
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::startup()
    }
}

impl RetryConfig {
    /// Opening a tier at startup: a few quick attempts, then give up and let
    /// the manager skip the tier.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            factor: 2.0,
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// The waits between attempts as an explicit table.
    #[must_use]
    pub fn schedule(&self) -> BackoffSchedule {
        let waits = self.max_attempts.saturating_sub(1) as usize;
        let delays = std::iter::successors(Some(self.initial_delay), |d| {
            Some(d.mul_f64(self.factor).min(self.max_delay))
        })
        .take(waits)
        .collect();
        BackoffSchedule::new(delays)
    }
}

/// Run `operation` until it succeeds or `config.max_attempts` is spent.
/// The last error is returned as is.
pub async fn retry<F, Fut, T, E>(name: &str, config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let schedule = config.schedule();
    let mut failures: u32 = 0;

    loop {
        let err = match operation().await {
            Ok(val) => {
                if failures > 0 {
                    info!(operation = name, failures, "Succeeded after retrying");
                }
                return Ok(val);
            }
            Err(err) => err,
        };

        failures += 1;
        if failures >= config.max_attempts.max(1) {
            warn!(operation = name, attempts = failures, error = %err, "Giving up");
            return Err(err);
        }
        let delay = schedule.delay_for(failures);
        warn!(operation = name, attempt = failures, max = config.max_attempts, error = %err, ?delay, "Attempt failed, retrying");
        sleep(delay).await;
    }
}

/// Delay table indexed by attempt count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    delays: Vec<Duration>,
}

impl BackoffSchedule {
    /// An empty table falls back to a single one-second delay.
    #[must_use]
    pub fn new(delays: Vec<Duration>) -> Self {
        if delays.is_empty() {
            return Self {
                delays: vec![Duration::from_secs(1)],
            };
        }
        Self { delays }
    }

    #[must_use]
    pub fn from_millis(delays_ms: &[u64]) -> Self {
        Self::new(delays_ms.iter().map(|ms| Duration::from_millis(*ms)).collect())
    }

    /// Delay before the next attempt of an item that has failed `attempts` times.
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let idx = (attempts.saturating_sub(1) as usize).min(self.delays.len() - 1);
        self.delays[idx]
    }

    /// The slowest item decides when a whole pass is retried.
    #[must_use]
    pub fn delay_for_all(&self, attempts: impl IntoIterator<Item = u32>) -> Option<Duration> {
        attempts.into_iter().map(|a| self.delay_for(a)).max()
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::from_millis(&[1_000, 5_000, 15_000, 60_000])
    }
}
