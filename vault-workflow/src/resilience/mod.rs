//! Resilience for external calls: retry, circuit breaking and time limits.
//!
//! Every call to a generator, an executor or git goes through
//! [`Resilience::call`], which layers them as retry(breaker(timeout(op))).
//! A breaker rejection is never retried; a timeout is.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use retry::RetryPolicy;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vault_common::config::ResilienceConfig;
use vault_common::{Error, Result};

/// Named breakers plus the shared retry policy and call timeout.
///
/// One instance is built at startup and handed to every component that talks
/// to the outside world, so breakers for the same dependency are shared.
#[derive(Debug)]
pub struct Resilience {
    policy: RetryPolicy,
    failure_threshold: u32,
    recovery_timeout: Duration,
    call_timeout: Duration,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Default for Resilience {
    fn default() -> Self {
        Self::from_config(&ResilienceConfig::default())
    }
}

impl Resilience {
    pub fn new(
        policy: RetryPolicy,
        failure_threshold: u32,
        recovery_timeout: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            policy,
            failure_threshold,
            recovery_timeout,
            call_timeout,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self::new(
            RetryPolicy::from_config(config),
            config.failure_threshold,
            Duration::from_secs(config.recovery_timeout_secs),
            Duration::from_secs(config.call_timeout_secs),
        )
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Breaker for `dependency`, created on first use.
    pub fn breaker(&self, dependency: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(breakers.entry(dependency.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                CircuitBreakerConfig::with_name(dependency)
                    .failure_threshold(self.failure_threshold)
                    .recovery_timeout(self.recovery_timeout),
            ))
        }))
    }

    /// Run `op` against `dependency` with retry, breaker and timeout.
    pub async fn call<T, F, Fut>(&self, dependency: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.breaker(dependency);
        let breaker: &CircuitBreaker = &breaker;
        let limit = self.call_timeout;

        self.policy
            .run(dependency, move || {
                // The operation is only started once the breaker admits it.
                let step = breaker.acquire().map(|admission| (admission, op()));
                async move {
                    let (admission, attempt) = step?;
                    let result = match tokio::time::timeout(limit, attempt).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::Timeout {
                            dependency: dependency.to_string(),
                            after: limit,
                        }),
                    };
                    match &result {
                        Err(e) if e.is_retryable() => admission.failure(),
                        _ => admission.success(),
                    }
                    result
                }
            })
            .await
    }

    /// Snapshot of every breaker created so far, sorted by name.
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        let mut stats: Vec<_> = breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn resilience(max_retries: u32, threshold: u32) -> Resilience {
        Resilience::new(
            RetryPolicy {
                max_retries,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
            },
            threshold,
            Duration::from_secs(60),
            Duration::from_secs(1),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried() {
        let r = resilience(2, 10);
        let calls = AtomicUsize::new(0);

        let value = r
            .call("git", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok(n)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(r.breaker("git").failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_short_circuits_retries() {
        let r = resilience(3, 2);
        let calls = AtomicUsize::new(0);

        let err = r
            .call("executor:email", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::retryable("executor:email", "503")) }
            })
            .await
            .unwrap_err();

        // Two failures trip the breaker; the third attempt is rejected unattempted.
        assert!(err.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(r.breaker("executor:email").state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_breakers_are_shared_by_name() {
        let r = resilience(0, 5);
        let a = r.breaker("generator:email");
        let b = r.breaker("generator:email");
        assert!(Arc::ptr_eq(&a, &b));
        r.breaker("git");

        let names: Vec<_> = r.stats().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["generator:email", "git"]);
    }
}
