//! Time limiter: bounds the latency of a single call
//!
//! The call runs on its own tokio task while the caller waits up to
//! `timeout_duration`. On timeout the caller receives
//! [`ResilienceError::Timeout`]; with `cancel_on_timeout` the task is also
//! aborted. Abort only takes effect at the task's next `.await`, so work that
//! never yields keeps running.
//!
//! # Example
//! ```no_run
//! use bulwark::time_limiter::{TimeLimiter, TimeLimiterConfig};
//! use bulwark::ResilienceError;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let limiter = TimeLimiter::new("search", TimeLimiterConfig {
//!     timeout_duration: Duration::from_millis(100),
//!     ..Default::default()
//! })?;
//!
//! let value = limiter
//!     .execute(|| async { Ok::<_, ResilienceError<std::io::Error>>(42) })
//!     .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::{ConfigurationError, ResilienceError};
use crate::event::{EventPublisher, PolicyEvent};
use crate::policy::{CallFuture, MetricsSnapshot, Policy};

/// Configuration for time limiter behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeLimiterConfig {
    /// Deadline for a single call
    pub timeout_duration: Duration,
    /// Abort the spawned task when the deadline elapses
    pub cancel_on_timeout: bool,
}

impl Default for TimeLimiterConfig {
    fn default() -> Self {
        Self {
            timeout_duration: Duration::from_secs(1),
            cancel_on_timeout: true,
        }
    }
}

impl TimeLimiterConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.timeout_duration.is_zero() {
            return Err(ConfigurationError::NotPositive {
                field: "timeout_duration",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeLimiterEventKind {
    Success,
    Error,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct TimeLimiterEvent {
    pub policy_name: String,
    pub created_at: DateTime<Utc>,
    pub kind: TimeLimiterEventKind,
    /// Time the caller spent waiting
    pub elapsed: Duration,
    /// Rendered error for `Error` events
    pub error: Option<String>,
}

impl PolicyEvent for TimeLimiterEvent {
    type Kind = TimeLimiterEventKind;

    fn kind(&self) -> TimeLimiterEventKind {
        self.kind
    }

    fn policy_name(&self) -> &str {
        &self.policy_name
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeLimiterMetrics {
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub timeout_calls: u64,
}

impl MetricsSnapshot for TimeLimiterMetrics {
    fn counters(&self) -> BTreeMap<&'static str, f64> {
        BTreeMap::from([
            ("successful_calls", self.successful_calls as f64),
            ("failed_calls", self.failed_calls as f64),
            ("timeout_calls", self.timeout_calls as f64),
        ])
    }
}

#[derive(Debug)]
struct Inner {
    name: String,
    config: TimeLimiterConfig,
    events: EventPublisher<TimeLimiterEvent>,
    successful: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

/// Deadline enforcement for async calls.
#[derive(Debug, Clone)]
pub struct TimeLimiter {
    inner: Arc<Inner>,
}

impl TimeLimiter {
    /// Create a new time limiter with the given configuration
    pub fn new(
        name: impl Into<String>,
        config: TimeLimiterConfig,
    ) -> Result<Self, ConfigurationError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConfigurationError::EmptyName);
        }
        config.validate()?;

        Ok(Self {
            inner: Arc::new(Inner {
                name,
                config,
                events: EventPublisher::new(),
                successful: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                timed_out: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &TimeLimiterConfig {
        &self.inner.config
    }

    /// Execute an operation under the configured deadline
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
        T: Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        self.execute_future(op()).await
    }

    /// Run an already-built future under the configured deadline
    pub async fn execute_future<Fut, T, E>(&self, fut: Fut) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
        T: Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        let timeout = self.inner.config.timeout_duration;
        let start = Instant::now();
        let mut handle = tokio::spawn(fut);

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(value))) => {
                self.inner.successful.fetch_add(1, Ordering::Relaxed);
                self.publish(TimeLimiterEventKind::Success, start.elapsed(), None);
                Ok(value)
            }
            Ok(Ok(Err(error))) => {
                self.inner.failed.fetch_add(1, Ordering::Relaxed);
                self.publish(
                    TimeLimiterEventKind::Error,
                    start.elapsed(),
                    Some(error.to_string()),
                );
                Err(error)
            }
            Ok(Err(join_error)) => {
                self.inner.failed.fetch_add(1, Ordering::Relaxed);
                let message = join_error.to_string();
                self.publish(
                    TimeLimiterEventKind::Error,
                    start.elapsed(),
                    Some(message.clone()),
                );
                Err(ResilienceError::Aborted(message))
            }
            Err(_) => {
                if self.inner.config.cancel_on_timeout {
                    handle.abort();
                }
                self.inner.timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    time_limiter = %self.inner.name,
                    timeout_ms = timeout.as_millis() as u64,
                    cancelled = self.inner.config.cancel_on_timeout,
                    "Call timed out"
                );
                self.publish(TimeLimiterEventKind::Timeout, start.elapsed(), None);
                Err(ResilienceError::Timeout {
                    name: self.inner.name.clone(),
                    timeout,
                })
            }
        }
    }

    /// Wrap `call` so that every invocation runs under this time limiter
    pub fn decorate<F, Fut, T, E>(
        &self,
        call: F,
    ) -> impl Fn() -> CallFuture<T, E> + Clone + Send + Sync + 'static
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
        T: Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        let limiter = self.clone();
        let call = Arc::new(call);
        move || -> CallFuture<T, E> {
            let limiter = limiter.clone();
            let call = call.clone();
            Box::pin(async move { limiter.execute(move || (*call)()).await })
        }
    }

    fn publish(&self, kind: TimeLimiterEventKind, elapsed: Duration, error: Option<String>) {
        if !self.inner.events.has_subscribers(kind) {
            return;
        }
        self.inner.events.publish(&TimeLimiterEvent {
            policy_name: self.inner.name.clone(),
            created_at: Utc::now(),
            kind,
            elapsed,
            error,
        });
    }
}

impl Policy for TimeLimiter {
    type Metrics = TimeLimiterMetrics;
    type Event = TimeLimiterEvent;

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn metrics(&self) -> TimeLimiterMetrics {
        TimeLimiterMetrics {
            successful_calls: self.inner.successful.load(Ordering::Relaxed),
            failed_calls: self.inner.failed.load(Ordering::Relaxed),
            timeout_calls: self.inner.timed_out.load(Ordering::Relaxed),
        }
    }

    fn events(&self) -> &EventPublisher<TimeLimiterEvent> {
        &self.inner.events
    }
}
