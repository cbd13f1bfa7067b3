//! Exponential backoff with full jitter.
//!
//! Each retried operation owns a fresh [`RetryContext`]. The window for the
//! n-th retry is `min(base * 2^n, max)` and the pause is drawn uniformly from
//! `[0, window]` using OS entropy. A context reports exhaustion on the call
//! that would otherwise schedule attempt `max_attempts + 1`.

use crate::time::Clock;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("entropy source unavailable: {0}")]
pub struct EntropyError(pub String);

impl From<getrandom::Error> for EntropyError {
    fn from(err: getrandom::Error) -> Self {
        Self(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum BackoffError {
    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error(transparent)]
    EntropyUnavailable(#[from] EntropyError),
}

/// Source of the random value used to place a pause inside its window.
pub trait EntropySource: Send + Sync {
    fn next_u64(&self) -> Result<u64, EntropyError>;
}

/// Operating-system CSPRNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn next_u64(&self) -> Result<u64, EntropyError> {
        Ok(getrandom::u64()?)
    }
}

/// Retry limits shared by every retried phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "RetryPolicy::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "RetryPolicy::default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "RetryPolicy::default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    const fn default_max_attempts() -> u32 {
        5
    }

    const fn default_base_delay_ms() -> u64 {
        500
    }

    const fn default_max_delay_ms() -> u64 {
        5_000
    }

    pub fn context(&self) -> RetryContext {
        RetryContext::new(self.max_attempts, self.base_delay_ms, self.max_delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            base_delay_ms: Self::default_base_delay_ms(),
            max_delay_ms: Self::default_max_delay_ms(),
        }
    }
}

/// Attempt counter for one retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryContext {
    attempts_done: u32,
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryContext {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            attempts_done: 0,
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    pub fn attempts_done(&self) -> u32 {
        self.attempts_done
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Upper bound of the pause for the next retry, in milliseconds.
    pub fn window_ms(&self) -> u64 {
        let factor = 1u64.checked_shl(self.attempts_done).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    /// Record a failed attempt and compute the pause before the next one.
    ///
    /// Exhaustion is reported without touching the entropy source.
    pub fn next_delay(&mut self, entropy: &dyn EntropySource) -> Result<Duration, BackoffError> {
        if self.attempts_done.saturating_add(1) >= self.max_attempts {
            self.attempts_done = self.max_attempts;
            return Err(BackoffError::RetriesExhausted {
                attempts: self.max_attempts,
            });
        }
        let window = self.window_ms();
        let random = entropy.next_u64()?;
        self.attempts_done += 1;
        Ok(Duration::from_millis(random % window.saturating_add(1)))
    }
}

/// Couples a retry policy with the clock that performs the pauses.
#[derive(Clone)]
pub struct Backoff<K: Clock> {
    policy: RetryPolicy,
    clock: K,
    entropy: Arc<dyn EntropySource>,
}

impl<K: Clock> Backoff<K> {
    pub fn new(policy: RetryPolicy, clock: K, entropy: Arc<dyn EntropySource>) -> Self {
        Self {
            policy,
            clock,
            entropy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn clock(&self) -> &K {
        &self.clock
    }

    pub fn start(&self) -> RetryContext {
        self.policy.context()
    }

    /// Compute the next pause for `ctx` and sleep through it.
    pub async fn pause(&self, ctx: &mut RetryContext) -> Result<Duration, BackoffError> {
        let delay = ctx.next_delay(self.entropy.as_ref())?;
        tracing::debug!(
            "backing off {}ms before attempt {}/{}",
            delay.as_millis(),
            ctx.attempts_done() + 1,
            ctx.max_attempts()
        );
        self.clock.sleep(delay).await;
        Ok(delay)
    }
}
