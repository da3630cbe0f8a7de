//! Throttling-aware retry policy
//!
//! Wraps a remote call and retries it on throttling responses and transient
//! transport faults. The wait before attempt `n` is
//!
//! - `wait_base_secs ^ n` seconds when the back end gave no hint, or
//! - `retry_after + wait_base_secs ^ (n - 1)` seconds when a throttling
//!   response carried a retry-after hint.
//!
//! The exponential term is capped at `max_wait_secs`; a server hint is never cut.
//! The number of retries consumed is returned with the value so callers can
//! record it alongside the result.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{GizmoError, GizmoResult};

/// Retry settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryOptions {
    /// Retries allowed after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base of the exponential backoff, in seconds
    #[serde(default = "default_wait_base_secs")]
    pub wait_base_secs: f64,

    /// Cap on the exponential term, in seconds
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: f64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_wait_base_secs() -> f64 {
    5.0
}

fn default_max_wait_secs() -> f64 {
    60.0
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            wait_base_secs: default_wait_base_secs(),
            max_wait_secs: default_max_wait_secs(),
        }
    }
}

/// Value produced by a retried call, with the retry bookkeeping for that call
#[derive(Debug, Clone)]
pub struct Retried<T> {
    pub value: T,
    /// Retries consumed (0 when the first attempt succeeded)
    pub retries: u32,
    /// Total time spent waiting between attempts
    pub waited: Duration,
}

/// Bounded exponential backoff triggered by throttling signals
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    options: RetryOptions,
}

impl RetryPolicy {
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }

    /// Single attempt, no retries. Used for connectivity probes.
    pub fn none() -> Self {
        Self::new(RetryOptions {
            max_retries: 0,
            ..RetryOptions::default()
        })
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// Wait before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exponent = match retry_after {
            Some(_) => attempt.saturating_sub(1),
            None => attempt,
        };
        let exp_secs = self
            .options
            .wait_base_secs
            .max(0.0)
            .powi(exponent as i32)
            .min(self.options.max_wait_secs.max(0.0));
        let exp = Duration::try_from_secs_f64(exp_secs).unwrap_or(Duration::MAX);

        match retry_after {
            Some(hint) => hint.saturating_add(exp),
            None => exp,
        }
    }

    /// Run `op` until it succeeds, fails non-retryably, exhausts the budget or
    /// `cancel` fires. `op` receives the zero-based attempt number.
    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> GizmoResult<Retried<T>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = GizmoResult<T>>,
    {
        let mut retries = 0u32;
        let mut waited = Duration::ZERO;

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(GizmoError::Cancelled),
                r = op(retries) => r,
            };

            let err = match result {
                Ok(value) => {
                    return Ok(Retried {
                        value,
                        retries,
                        waited,
                    })
                }
                Err(e) => e,
            };

            if err.is_cancelled() {
                debug!("Call cancelled after {} retries", retries);
                return Err(err);
            }
            if !err.is_retryable() {
                return Err(err.into_terminal(retries));
            }
            if retries >= self.options.max_retries {
                warn!("Retry budget exhausted after {} retries: {}", retries, err);
                return Err(err.into_terminal(retries));
            }

            retries += 1;
            let wait = self.backoff(retries, err.retry_after());
            warn!("Retry {}/{} in {:?}: {}", retries, self.options.max_retries, wait, err);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GizmoError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
            waited = waited.saturating_add(wait);
        }
    }
}
