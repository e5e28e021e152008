//! One-shot decoration helpers
//!
//! Each helper builds a fresh policy instance from `config` and wraps `call`
//! with it. The instance lives as long as the returned closure, so build the
//! decorated call once and reuse it; building one per invocation throws the
//! accumulated state away.
//!
//! ```no_run
//! use bulwark::decorators::{with_circuit_breaker, with_retry};
//! use bulwark::{CircuitBreakerConfig, ResilienceError, RetryConfig};
//!
//! # fn example() -> Result<(), bulwark::ConfigurationError> {
//! let fetch = || async { Ok::<_, ResilienceError<std::io::Error>>("payload") };
//!
//! let guarded = with_circuit_breaker("backend", fetch, CircuitBreakerConfig::default())?;
//! let resilient = with_retry("backend", guarded, RetryConfig::default())?;
//! # let _ = resilient;
//! # Ok(())
//! # }
//! ```

use std::error::Error as StdError;
use std::future::Future;

use crate::bulkhead::{Bulkhead, BulkheadConfig};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::{ConfigurationError, ResilienceError};
use crate::policy::CallFuture;
use crate::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::retry::{Retry, RetryConfig};
use crate::thread_pool_bulkhead::{ThreadPoolBulkhead, ThreadPoolBulkheadConfig};
use crate::time_limiter::{TimeLimiter, TimeLimiterConfig};

pub fn with_time_limiter<F, Fut, T, E>(
    name: impl Into<String>,
    call: F,
    config: TimeLimiterConfig,
) -> Result<impl Fn() -> CallFuture<T, E> + Clone + Send + Sync + 'static, ConfigurationError>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
    T: Send + 'static,
    E: StdError + Send + Sync + 'static,
{
    Ok(TimeLimiter::new(name, config)?.decorate(call))
}

pub fn with_rate_limiter<F, Fut, T, E>(
    name: impl Into<String>,
    call: F,
    config: RateLimiterConfig,
) -> Result<impl Fn() -> CallFuture<T, E> + Clone + Send + Sync + 'static, ConfigurationError>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
    T: Send + 'static,
    E: StdError + Send + Sync + 'static,
{
    Ok(RateLimiter::new(name, config)?.decorate(call))
}

pub fn with_retry<F, Fut, T, E>(
    name: impl Into<String>,
    call: F,
    config: RetryConfig,
) -> Result<impl Fn() -> CallFuture<T, E> + Clone + Send + Sync + 'static, ConfigurationError>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
    T: Send + 'static,
    E: StdError + Send + Sync + 'static,
{
    Ok(Retry::new(name, config)?.decorate(call))
}

pub fn with_circuit_breaker<F, Fut, T, E>(
    name: impl Into<String>,
    call: F,
    config: CircuitBreakerConfig,
) -> Result<impl Fn() -> CallFuture<T, E> + Clone + Send + Sync + 'static, ConfigurationError>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
    T: Send + 'static,
    E: StdError + Send + Sync + 'static,
{
    Ok(CircuitBreaker::new(name, config)?.decorate(call))
}

pub fn with_bulkhead<F, Fut, T, E>(
    name: impl Into<String>,
    call: F,
    config: BulkheadConfig,
) -> Result<impl Fn() -> CallFuture<T, E> + Clone + Send + Sync + 'static, ConfigurationError>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
    T: Send + 'static,
    E: StdError + Send + Sync + 'static,
{
    Ok(Bulkhead::new(name, config)?.decorate(call))
}

/// Thread-pool analogue of the helpers above.
///
/// Also returns the pool handle: worker threads outlive the closure until
/// [`ThreadPoolBulkhead::shutdown`] is called.
#[allow(clippy::type_complexity)]
pub fn with_thread_pool_bulkhead<F, T, E>(
    name: impl Into<String>,
    call: F,
    config: ThreadPoolBulkheadConfig,
) -> Result<
    (
        ThreadPoolBulkhead,
        impl Fn() -> CallFuture<T, E> + Clone + Send + Sync + 'static,
    ),
    ConfigurationError,
>
where
    F: Fn() -> Result<T, ResilienceError<E>> + Send + Sync + 'static,
    T: Send + 'static,
    E: StdError + Send + Sync + 'static,
{
    let pool = ThreadPoolBulkhead::new(name, config)?;
    let decorated = pool.decorate(call);
    Ok((pool, decorated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_invalid_config_surfaces_at_construction() {
        let call = || async { Ok::<_, ResilienceError<io::Error>>(()) };
        let result = with_bulkhead(
            "db",
            call,
            BulkheadConfig {
                max_concurrent_calls: 0,
                ..Default::default()
            },
        );
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_helpers_compose() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let flaky = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(ResilienceError::Call(io::Error::other("transient")))
                } else {
                    Ok(n)
                }
            }
        };

        let limited = with_time_limiter(
            "backend",
            flaky,
            TimeLimiterConfig {
                timeout_duration: Duration::from_secs(1),
                ..Default::default()
            },
        )
        .unwrap();
        let retried = with_retry(
            "backend",
            limited,
            RetryConfig {
                wait_duration: Some(Duration::from_millis(10)),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(retried().await.unwrap(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_thread_pool_helper() {
        let (pool, call) = with_thread_pool_bulkhead(
            "reports",
            || Ok::<_, ResilienceError<io::Error>>(6 * 7),
            ThreadPoolBulkheadConfig {
                max_thread_pool_size: 1,
                core_thread_pool_size: 1,
                queue_capacity: 4,
                keep_alive_duration: Duration::from_millis(20),
            },
        )
        .unwrap();

        assert_eq!(call().await.unwrap(), 42);
        pool.shutdown();
    }
}
