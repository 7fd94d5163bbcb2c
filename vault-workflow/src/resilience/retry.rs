//! Exponential backoff with jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use vault_common::config::ResilienceConfig;
use vault_common::Result;

/// Retry policy for external calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Backoff before retry number `attempt + 1`, without jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let delay_ms = base_ms
            .saturating_mul(2_u64.saturating_pow(attempt))
            .min(max_ms);
        Duration::from_millis(delay_ms)
    }

    /// Backoff plus up to 50% random jitter.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.backoff_delay(attempt);
        let half_ms = u64::try_from(delay.as_millis() / 2).unwrap_or(u64::MAX);
        let jitter_ms = if half_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=half_ms)
        };
        delay + Duration::from_millis(jitter_ms)
    }

    /// Run `op` until it succeeds, fails non-retryably, or retries run out.
    pub async fn run<T, F, Fut>(&self, dependency: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_if(dependency, op, |e| e.is_retryable()).await
    }

    /// Like [`run`](Self::run) with a caller-supplied retry predicate.
    pub async fn run_if<T, F, Fut, P>(&self, dependency: &str, mut op: F, should_retry: P) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&vault_common::Error) -> bool,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(
                            dependency,
                            attempt = attempt + 1,
                            "Call recovered after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(e) if attempt < self.max_retries && should_retry(&e) => {
                    let delay = self.jittered_delay(attempt);
                    tracing::warn!(
                        dependency,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
