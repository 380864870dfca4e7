//! Rate-limited, retrying wrapper for outbound remote calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use super::RemoteError;
use crate::config::EngineConfig;

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Relative jitter applied to each delay (0.25 = ±25%)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// `base * 2^retry`, capped at `max_delay`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2_u32.saturating_pow(retry);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Backoff scaled by `1 + unit * jitter`, where `unit` is in `[-1, 1]`.
    pub fn jittered(&self, retry: u32, unit: f64) -> Duration {
        let scale = unit.clamp(-1.0, 1.0).mul_add(self.jitter, 1.0).max(0.0);
        self.backoff(retry).mul_f64(scale)
    }

    fn random_delay(&self, retry: u32) -> Duration {
        let unit = rand::thread_rng().gen_range(-1.0..=1.0);
        self.jittered(retry, unit)
    }
}

/// Per-call behavior switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    /// Retry requests that timed out. The importer turns this off: a timeout
    /// there means the query is too deep, and repeating it won't help.
    pub retry_timeouts: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            retry_timeouts: true,
        }
    }
}

/// One logical connection to the remote service.
///
/// Requests issued through the same client (or its clones) are spaced at
/// least `min_interval` apart; failures are retried per the [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RateLimitedClient {
    policy: RetryPolicy,
    min_interval: Duration,
    last_request: Arc<Mutex<Option<Instant>>>,
}

impl RateLimitedClient {
    pub fn new(policy: RetryPolicy, min_interval: Duration) -> Self {
        Self {
            policy,
            min_interval,
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.retry_policy(), config.min_request_interval)
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` with throttling and the default retry behavior.
    pub async fn call<T, F, Fut>(&self, label: &str, operation: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        self.call_with(label, CallOptions::default(), operation)
            .await
    }

    /// Run `operation`, retrying retryable failures with jittered backoff.
    ///
    /// Non-retryable failures, and the last failure once attempts run out,
    /// are returned unchanged.
    pub async fn call_with<T, F, Fut>(
        &self,
        label: &str,
        options: CallOptions,
        mut operation: F,
    ) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt = 0_u32;
        loop {
            self.throttle().await;
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            attempt += 1;
            let retryable =
                error.is_retryable() && (options.retry_timeouts || !error.is_timeout());
            if !retryable || attempt >= self.policy.max_attempts {
                return Err(error);
            }

            let mut delay = self.policy.random_delay(attempt - 1);
            if let Some(hint) = error.retry_after {
                delay = delay.max(hint);
            }
            tracing::warn!(
                operation = label,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Remote call failed; backing off"
            );
            sleep(delay).await;
        }
    }

    /// Wait until `min_interval` has passed since the previous request.
    async fn throttle(&self) {
        let mut last_request = self.last_request.lock().await;
        if let Some(previous) = *last_request {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *last_request = Some(Instant::now());
    }
}
