// ABOUTME: Bounded-attempt exponential-backoff retry wrapper for network stages
// ABOUTME: Retries only failures classified as transient, propagating the final error unchanged
//
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::future::Future;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::debug;

use crate::errors::SyncResult;

/// Bounded exponential-backoff retry policy.
///
/// Two independent instances drive the pipeline: one around the combined
/// authenticate-and-fetch stage and one around the report-completion poll.
/// They are deliberately not shared — a "report still generating" response
/// must be retried faster and more patiently than a login failure.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the second attempt
    pub min_delay: Duration,
    /// Total attempt budget, including the first attempt
    pub max_attempts: u32,
    /// Multiplier applied to the delay after each failed attempt
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(3),
            max_attempts: 3,
            backoff_factor: 1.5,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay after the given 1-based attempt number fails
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        self.min_delay.mul_f64(self.backoff_factor.powi(exponent))
    }

    /// Run `op` until it succeeds, fails fatally, or the attempt budget
    /// is exhausted. The closure receives the 1-based attempt number.
    ///
    /// Fatal failures (per [`crate::errors::SyncError::is_retryable`]) and the last
    /// failed attempt propagate the error unchanged.
    ///
    /// # Errors
    ///
    /// Returns the final error produced by `op`.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> SyncResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, %err, "retrying after transient failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Like [`RetryPolicy::run`] for operations that need exclusive access
    /// to shared pipeline state across attempts.
    ///
    /// The plain `run` cannot express a closure whose future mutably
    /// borrows captured state on every call, so the state is threaded
    /// through explicitly and the future is boxed.
    ///
    /// # Errors
    ///
    /// Returns the final error produced by `op`.
    pub async fn run_with_state<S, T, F>(&self, state: &mut S, mut op: F) -> SyncResult<T>
    where
        F: for<'a> FnMut(&'a mut S, u32) -> BoxFuture<'a, SyncResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(state, attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, %err, "retrying after transient failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
