/*!
 * Bulwark - fault-tolerance policies for async Rust
 *
 * Decorators that wrap a fallible call and add one concern each:
 * - TimeLimiter: bound a call's duration, optionally cancelling it
 * - RateLimiter: cap calls per refresh period using cycle-based permits
 * - Retry: re-invoke on classified failures with pluggable backoff
 * - CircuitBreaker: sliding-window failure and slow-call tracking with
 *   CLOSED / OPEN / HALF_OPEN transitions
 * - Bulkhead: semaphore-bounded concurrency
 * - ThreadPoolBulkhead: bounded worker pool with a bounded queue
 *
 * Every policy exposes an event stream and a metrics snapshot, and every
 * decorated call keeps the shape `Fn() -> Future<Output = Result<T, ResilienceError<E>>>`
 * so policies stack in any order.
 */

pub mod bulkhead;
pub mod circuit_breaker;
pub mod classify;
pub mod config;
pub mod decorators;
pub mod error;
pub mod event;
pub mod logging;
pub mod policy;
pub mod rate_limiter;
pub mod retry;
pub mod thread_pool_bulkhead;
pub mod time_limiter;

// Re-export commonly used types
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadEvent, BulkheadEventKind, BulkheadMetrics};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerEvent, CircuitBreakerEventKind,
    CircuitBreakerMetrics, CircuitState, SlidingWindowType,
};
pub use classify::{ErrorClassifier, ErrorPredicate, ResultPredicate};
pub use config::{LoggingConfig, ResilienceSettings};
pub use error::{ConfigurationError, Failure, PolicyErrorKind, ResilienceError};
pub use event::{EventPublisher, PolicyEvent};
pub use policy::{CallFuture, MetricsSnapshot, Policy};
pub use rate_limiter::{
    RateLimiter, RateLimiterConfig, RateLimiterEvent, RateLimiterEventKind, RateLimiterMetrics,
};
pub use retry::{IntervalBiFunction, IntervalFunction, Retry, RetryConfig, RetryEvent, RetryEventKind, RetryMetrics};
pub use thread_pool_bulkhead::{
    BulkheadFuture, ThreadPoolBulkhead, ThreadPoolBulkheadConfig, ThreadPoolBulkheadMetrics,
};
pub use time_limiter::{
    TimeLimiter, TimeLimiterConfig, TimeLimiterEvent, TimeLimiterEventKind, TimeLimiterMetrics,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Convenient imports for decorating calls
pub mod prelude {
    pub use crate::decorators::{
        with_bulkhead, with_circuit_breaker, with_rate_limiter, with_retry,
        with_thread_pool_bulkhead, with_time_limiter,
    };
    pub use crate::{
        Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig, CircuitState,
        ConfigurationError, ErrorPredicate, MetricsSnapshot, Policy, RateLimiter,
        RateLimiterConfig, ResilienceError, Retry, RetryConfig, ThreadPoolBulkhead,
        ThreadPoolBulkheadConfig, TimeLimiter, TimeLimiterConfig,
    };
}
