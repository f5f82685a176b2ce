//! Exponential backoff for transport attempts.
//!
//! Every attempt outcome is [classified](classify) first. Successes and permanent failures end
//! the logical fetch right away, transient failures are retried after `base × 2^retry` until the
//! attempts are exhausted.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;

use crate::caching::{CacheContents, CacheError};
use crate::config::FetchConfig;
use crate::transport::{Response, TransportError};

/// The largest share of the computed delay that is added as jitter.
const MAX_JITTER: f64 = 0.25;

/// Status codes outside of the 5xx range that are worth retrying.
const RETRYABLE_STATUS: &[u16] = &[408, 429];

/// The classified outcome of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// The payload of a successful response.
    Success(Bytes),
    /// A failure that might go away when trying again.
    Transient(String),
    /// A failure that will not go away.
    Permanent(CacheError),
}

/// Classifies the outcome of a single transport attempt.
///
/// Connection failures, timeouts, 5xx responses as well as `408` and `429` are transient. All
/// other non-success statuses are [`CacheError::InvalidResponse`], malformed requests and
/// undecodable responses are [`CacheError::PermanentFailure`].
pub fn classify(outcome: Result<Response, TransportError>) -> Attempt {
    match outcome {
        Ok(response) if response.is_success() => Attempt::Success(response.payload),
        Ok(response)
            if response.status >= 500 || RETRYABLE_STATUS.contains(&response.status) =>
        {
            Attempt::Transient(format!("server responded with status {}", response.status))
        }
        Ok(response) => Attempt::Permanent(CacheError::InvalidResponse(response.status)),
        Err(err @ (TransportError::Timeout(_) | TransportError::Connection(_))) => {
            Attempt::Transient(err.to_string())
        }
        Err(err @ (TransportError::InvalidRequest(_) | TransportError::Decode(_))) => {
            Attempt::Permanent(CacheError::PermanentFailure(err.to_string()))
        }
    }
}

/// The progress of one logical fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// The attempt currently running, starting at `1`.
    pub attempt: u32,
    /// The delay applied before the next attempt, if it is a retry.
    pub next_delay: Duration,
}

/// How often and how patiently to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The total number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay before the first retry.
    pub base_delay: Duration,
    /// Whether to add random jitter to the delays.
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts.max(1),
            base_delay: config.base_retry_delay,
            jitter: config.retry_jitter,
        }
    }

    /// The delay before retry number `retry`, counting from `0`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let jitter = rand::rng().random_range(0.0..=MAX_JITTER);
        delay.saturating_add(delay.mul_f64(jitter))
    }

    /// Runs attempts produced by `task_gen` until one succeeds, fails permanently, or all attempts
    /// are used up.
    ///
    /// `task_gen` receives the number of the attempt, starting at `1`.
    pub async fn run<G, F>(&self, mut task_gen: G) -> CacheContents
    where
        G: FnMut(u32) -> F,
        F: Future<Output = Result<Response, TransportError>>,
    {
        let mut state = RetryState {
            attempt: 0,
            next_delay: Duration::ZERO,
        };

        loop {
            state.attempt += 1;
            metric!(counter("fetch.attempts") += 1);

            let reason = match classify(task_gen(state.attempt).await) {
                Attempt::Success(payload) => break Ok(payload),
                Attempt::Permanent(err) => {
                    tracing::debug!(attempt = state.attempt, "Fetch failed permanently: {err}");
                    break Err(err);
                }
                Attempt::Transient(reason) => reason,
            };

            if state.attempt >= self.max_attempts {
                tracing::debug!(attempts = state.attempt, "Giving up on fetch: {reason}");
                break Err(CacheError::TransientFailure {
                    attempts: state.attempt,
                    reason,
                });
            }

            state.next_delay = self.delay_for(state.attempt - 1);
            tracing::debug!(
                attempt = state.attempt,
                delay = ?state.next_delay,
                "Retrying fetch after transient failure: {reason}"
            );
            metric!(counter("fetch.retries") += 1);

            tokio::time::sleep(state.next_delay).await;
        }
    }
}
