//! Retry with classification and backoff
//!
//! Each invocation runs up to `max_attempts` times. After every failing or
//! unsatisfactory attempt except the last, a `Retry` event fires and the
//! calling task sleeps for the configured interval. The attempt counter is
//! local to the invocation; only the aggregate counters live on the shared
//! instance.
//!
//! Errors are classified by an ordered chain (see [`crate::classify`]):
//! ignored errors propagate at once and count as nothing, errors outside an
//! explicit retry set propagate as failures, everything else is retried.
//!
//! When the last attempt still yields an unsatisfactory *result* (not an
//! error) the outcome counts as `failed_calls_with_retry` and an `Error`
//! event fires. The caller receives [`ResilienceError::MaxRetriesExceeded`]
//! if `fail_after_max_attempts` is set, and the last result otherwise.

use std::any::Any;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

use crate::classify::{Classification, ErrorClassifier, ErrorPredicate, ResultPredicate};
use crate::error::{ConfigurationError, Failure, ResilienceError};
use crate::event::{EventPublisher, PolicyEvent};
use crate::policy::{CallFuture, MetricsSnapshot, Policy};

/// Wait used when no interval is configured
pub const DEFAULT_WAIT_DURATION: Duration = Duration::from_millis(500);

/// Computes the wait before the next attempt from the number of attempts
/// made so far (1 after the first failure).
#[derive(Clone)]
pub struct IntervalFunction(Arc<dyn Fn(u32) -> Duration + Send + Sync>);

impl IntervalFunction {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn fixed(wait: Duration) -> Self {
        Self::new(move |_| wait)
    }

    /// `initial * multiplier^(attempt - 1)`
    pub fn exponential(initial: Duration, multiplier: f64) -> Self {
        Self::new(move |attempt| backoff(initial, multiplier, attempt))
    }

    /// Exponential backoff that never exceeds `max`
    pub fn exponential_capped(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self::new(move |attempt| backoff(initial, multiplier, attempt).min(max))
    }

    /// Uniformly random wait in `base ± base * randomization_factor`
    pub fn randomized(base: Duration, randomization_factor: f64) -> Self {
        let factor = randomization_factor.clamp(0.0, 1.0);
        Self::new(move |_| {
            let base_secs = base.as_secs_f64();
            let delta = base_secs * factor;
            if delta <= 0.0 {
                return base;
            }
            let secs = rand::rng().random_range((base_secs - delta)..=(base_secs + delta));
            Duration::from_secs_f64(secs.max(0.0))
        })
    }

    pub fn interval(&self, attempt: u32) -> Duration {
        (self.0)(attempt)
    }
}

impl fmt::Debug for IntervalFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IntervalFunction(..)")
    }
}

fn backoff(initial: Duration, multiplier: f64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let secs = initial.as_secs_f64() * multiplier.powi(exponent);
    if secs.is_finite() {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    } else {
        Duration::MAX
    }
}

/// What the previous attempt produced, as seen by an [`IntervalBiFunction`].
#[derive(Debug, Clone, Copy)]
pub enum RetryOutcome<'a> {
    /// Unsatisfactory successful result
    Result(&'a dyn Any),
    /// Retryable failure
    Failure(Failure<'a>),
}

/// Computes the wait from the attempt count and the last outcome.
#[derive(Clone)]
pub struct IntervalBiFunction(Arc<dyn Fn(u32, &RetryOutcome<'_>) -> Duration + Send + Sync>);

impl IntervalBiFunction {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(u32, &RetryOutcome<'_>) -> Duration + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn interval(&self, attempt: u32, outcome: &RetryOutcome<'_>) -> Duration {
        (self.0)(attempt, outcome)
    }
}

impl fmt::Debug for IntervalBiFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IntervalBiFunction(..)")
    }
}

/// Configuration for retry behavior
///
/// At most one of `wait_duration`, `interval_function` and
/// `interval_bi_function` may be set; with none set the wait is
/// [`DEFAULT_WAIT_DURATION`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first call
    pub max_attempts: u32,
    pub wait_duration: Option<Duration>,
    pub interval_function: Option<IntervalFunction>,
    pub interval_bi_function: Option<IntervalBiFunction>,
    /// Errors that propagate immediately without being counted
    pub ignore_errors: Vec<ErrorPredicate>,
    /// Explicit retry set; when non-empty (or `retry_on_error` is set) only
    /// matching errors are retried
    pub retry_errors: Vec<ErrorPredicate>,
    pub retry_on_error: Option<ErrorPredicate>,
    /// Successful results matching this predicate are retried
    pub retry_on_result: Option<ResultPredicate>,
    /// Fail with `MaxRetriesExceeded` when attempts run out on a result
    pub fail_after_max_attempts: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            wait_duration: None,
            interval_function: None,
            interval_bi_function: None,
            ignore_errors: Vec::new(),
            retry_errors: Vec::new(),
            retry_on_error: None,
            retry_on_result: None,
            fail_after_max_attempts: false,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_attempts == 0 {
            return Err(ConfigurationError::NotPositive {
                field: "max_attempts",
            });
        }

        let intervals = [
            self.wait_duration.is_some(),
            self.interval_function.is_some(),
            self.interval_bi_function.is_some(),
        ];
        if intervals.iter().filter(|set| **set).count() > 1 {
            return Err(ConfigurationError::Conflict(
                "wait_duration, interval_function and interval_bi_function",
            ));
        }
        Ok(())
    }

    fn classifier(&self) -> ErrorClassifier {
        let classifier = self
            .ignore_errors
            .iter()
            .cloned()
            .fold(ErrorClassifier::new(), ErrorClassifier::ignore);
        self.retry_errors
            .iter()
            .chain(self.retry_on_error.iter())
            .cloned()
            .fold(classifier, ErrorClassifier::include)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryEventKind {
    Retry,
    Success,
    Error,
    IgnoredError,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub policy_name: String,
    pub created_at: DateTime<Utc>,
    pub kind: RetryEventKind,
    /// Attempts made so far in this invocation
    pub attempt: u32,
    /// Wait before the next attempt (`Retry` events only)
    pub wait: Option<Duration>,
    /// Last error, rendered; `None` when the last outcome was a result
    pub error: Option<String>,
}

impl PolicyEvent for RetryEvent {
    type Kind = RetryEventKind;

    fn kind(&self) -> RetryEventKind {
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
pub struct RetryMetrics {
    pub successful_calls_without_retry: u64,
    pub successful_calls_with_retry: u64,
    pub failed_calls_without_retry: u64,
    pub failed_calls_with_retry: u64,
}

impl MetricsSnapshot for RetryMetrics {
    fn counters(&self) -> BTreeMap<&'static str, f64> {
        BTreeMap::from([
            (
                "successful_calls_without_retry",
                self.successful_calls_without_retry as f64,
            ),
            (
                "successful_calls_with_retry",
                self.successful_calls_with_retry as f64,
            ),
            (
                "failed_calls_without_retry",
                self.failed_calls_without_retry as f64,
            ),
            ("failed_calls_with_retry", self.failed_calls_with_retry as f64),
        ])
    }
}

#[derive(Debug, Default)]
struct Counters {
    succeeded_without_retry: AtomicU64,
    succeeded_with_retry: AtomicU64,
    failed_without_retry: AtomicU64,
    failed_with_retry: AtomicU64,
}

impl Counters {
    fn success(&self, attempt: u32) {
        let counter = if attempt > 1 {
            &self.succeeded_with_retry
        } else {
            &self.succeeded_without_retry
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn failure(&self, attempt: u32) {
        let counter = if attempt > 1 {
            &self.failed_with_retry
        } else {
            &self.failed_without_retry
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct Inner {
    name: String,
    config: RetryConfig,
    classifier: ErrorClassifier,
    counters: Counters,
    events: EventPublisher<RetryEvent>,
}

/// Retries failing or unsatisfactory calls
///
/// # Example
/// ```no_run
/// use bulwark::retry::{Retry, RetryConfig};
/// use bulwark::ResilienceError;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let retry = Retry::new("backend", RetryConfig {
///     max_attempts: 4,
///     wait_duration: Some(Duration::from_millis(50)),
///     ..Default::default()
/// })?;
///
/// let value = retry
///     .execute(|| async { Ok::<_, ResilienceError<std::io::Error>>(42) })
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Retry {
    inner: Arc<Inner>,
}

impl Retry {
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Result<Self, ConfigurationError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConfigurationError::EmptyName);
        }
        config.validate()?;

        Ok(Self {
            inner: Arc::new(Inner {
                name,
                classifier: config.classifier(),
                config,
                counters: Counters::default(),
                events: EventPublisher::new(),
            }),
        })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.inner.config
    }

    /// Execute an operation, retrying per the configuration
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        T: 'static,
        E: StdError + 'static,
    {
        let config = &self.inner.config;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let wait = match op().await {
                Ok(value) => {
                    let unsatisfactory = config
                        .retry_on_result
                        .as_ref()
                        .is_some_and(|predicate| predicate.test(&value));

                    if !unsatisfactory {
                        self.inner.counters.success(attempt);
                        if attempt > 1 {
                            self.publish(RetryEventKind::Success, attempt, None, None);
                        }
                        return Ok(value);
                    }

                    if attempt >= config.max_attempts {
                        self.inner.counters.failure(attempt);
                        tracing::warn!(
                            retry = %self.inner.name,
                            attempts = attempt,
                            "Result still unsatisfactory after final attempt"
                        );
                        self.publish(RetryEventKind::Error, attempt, None, None);
                        if config.fail_after_max_attempts {
                            return Err(ResilienceError::MaxRetriesExceeded {
                                name: self.inner.name.clone(),
                                attempts: attempt,
                            });
                        }
                        return Ok(value);
                    }

                    let wait = self.interval(attempt, &RetryOutcome::Result(&value));
                    self.publish(RetryEventKind::Retry, attempt, Some(wait), None);
                    wait
                }
                Err(error) => {
                    let failure = error.failure();
                    match self.inner.classifier.classify(&failure) {
                        Classification::Ignored => {
                            self.publish(
                                RetryEventKind::IgnoredError,
                                attempt,
                                None,
                                Some(failure.to_string()),
                            );
                            return Err(error);
                        }
                        Classification::Excluded => {
                            self.inner.counters.failure(attempt);
                            self.publish(
                                RetryEventKind::Error,
                                attempt,
                                None,
                                Some(failure.to_string()),
                            );
                            return Err(error);
                        }
                        Classification::Included if attempt >= config.max_attempts => {
                            self.inner.counters.failure(attempt);
                            tracing::warn!(
                                retry = %self.inner.name,
                                attempts = attempt,
                                error = %failure,
                                "Retries exhausted"
                            );
                            self.publish(
                                RetryEventKind::Error,
                                attempt,
                                None,
                                Some(failure.to_string()),
                            );
                            return Err(error);
                        }
                        Classification::Included => {
                            let wait = self.interval(attempt, &RetryOutcome::Failure(failure));
                            self.publish(
                                RetryEventKind::Retry,
                                attempt,
                                Some(wait),
                                Some(failure.to_string()),
                            );
                            wait
                        }
                    }
                }
            };

            tracing::debug!(
                retry = %self.inner.name,
                attempt,
                wait_ms = wait.as_millis() as u64,
                "Retrying after backoff"
            );
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// Wrap `call` so that every invocation is retried per this instance
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
        let retry = self.clone();
        let call = Arc::new(call);
        move || -> CallFuture<T, E> {
            let retry = retry.clone();
            let call = call.clone();
            Box::pin(async move { retry.execute(|| (*call)()).await })
        }
    }

    fn interval(&self, attempt: u32, outcome: &RetryOutcome<'_>) -> Duration {
        let config = &self.inner.config;
        if let Some(bi) = &config.interval_bi_function {
            bi.interval(attempt, outcome)
        } else if let Some(function) = &config.interval_function {
            function.interval(attempt)
        } else {
            config.wait_duration.unwrap_or(DEFAULT_WAIT_DURATION)
        }
    }

    fn publish(
        &self,
        kind: RetryEventKind,
        attempt: u32,
        wait: Option<Duration>,
        error: Option<String>,
    ) {
        if !self.inner.events.has_subscribers(kind) {
            return;
        }
        self.inner.events.publish(&RetryEvent {
            policy_name: self.inner.name.clone(),
            created_at: Utc::now(),
            kind,
            attempt,
            wait,
            error,
        });
    }
}

impl Policy for Retry {
    type Metrics = RetryMetrics;
    type Event = RetryEvent;

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn metrics(&self) -> RetryMetrics {
        let counters = &self.inner.counters;
        RetryMetrics {
            successful_calls_without_retry: counters.succeeded_without_retry.load(Ordering::Relaxed),
            successful_calls_with_retry: counters.succeeded_with_retry.load(Ordering::Relaxed),
            failed_calls_without_retry: counters.failed_without_retry.load(Ordering::Relaxed),
            failed_calls_with_retry: counters.failed_with_retry.load(Ordering::Relaxed),
        }
    }

    fn events(&self) -> &EventPublisher<RetryEvent> {
        &self.inner.events
    }
}
