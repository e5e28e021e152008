//! Semaphore bulkhead
//!
//! Admits at most `max_concurrent_calls` calls at once. A caller that finds
//! no free permit waits up to `max_wait_duration` and is then rejected with
//! [`ResilienceError::BulkheadFull`] without consuming a permit.
//!
//! Permits are taken out of the semaphore and tracked in an in-flight
//! counter so that [`Bulkhead::on_complete`] can return them without ever
//! releasing more than were acquired.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::error::{ConfigurationError, ResilienceError};
use crate::event::{EventPublisher, PolicyEvent};
use crate::policy::{CallFuture, MetricsSnapshot, Policy};

/// Configuration for the semaphore bulkhead
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadConfig {
    pub max_concurrent_calls: u32,
    /// How long a caller may wait for a permit; zero rejects immediately
    pub max_wait_duration: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 25,
            max_wait_duration: Duration::ZERO,
        }
    }
}

impl BulkheadConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_concurrent_calls == 0 {
            return Err(ConfigurationError::NotPositive {
                field: "max_concurrent_calls",
            });
        }
        Ok(())
    }
}

/// Event kinds shared by both bulkhead flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BulkheadEventKind {
    CallPermitted,
    CallRejected,
    CallFinished,
}

#[derive(Debug, Clone)]
pub struct BulkheadEvent {
    pub policy_name: String,
    pub created_at: DateTime<Utc>,
    pub kind: BulkheadEventKind,
}

impl BulkheadEvent {
    pub(crate) fn new(policy_name: &str, kind: BulkheadEventKind) -> Self {
        Self {
            policy_name: policy_name.to_string(),
            created_at: Utc::now(),
            kind,
        }
    }
}

impl PolicyEvent for BulkheadEvent {
    type Kind = BulkheadEventKind;

    fn kind(&self) -> BulkheadEventKind {
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
pub struct BulkheadMetrics {
    pub available_concurrent_calls: u32,
    pub max_allowed_concurrent_calls: u32,
    pub rejected_calls: u64,
}

impl MetricsSnapshot for BulkheadMetrics {
    fn counters(&self) -> BTreeMap<&'static str, f64> {
        BTreeMap::from([
            (
                "available_concurrent_calls",
                f64::from(self.available_concurrent_calls),
            ),
            (
                "max_allowed_concurrent_calls",
                f64::from(self.max_allowed_concurrent_calls),
            ),
            ("rejected_calls", self.rejected_calls as f64),
        ])
    }
}

#[derive(Debug)]
struct Inner {
    name: String,
    config: BulkheadConfig,
    semaphore: Semaphore,
    in_flight: AtomicU32,
    rejected: AtomicU64,
    events: EventPublisher<BulkheadEvent>,
}

/// Bounded-concurrency admission gate
///
/// # Example
/// ```no_run
/// use bulwark::bulkhead::{Bulkhead, BulkheadConfig};
/// use bulwark::ResilienceError;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bulkhead = Bulkhead::new("db", BulkheadConfig {
///     max_concurrent_calls: 10,
///     ..Default::default()
/// })?;
///
/// let rows = bulkhead
///     .execute(|| async { Ok::<_, ResilienceError<std::io::Error>>(vec![1, 2, 3]) })
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Bulkhead {
    inner: Arc<Inner>,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Result<Self, ConfigurationError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConfigurationError::EmptyName);
        }
        config.validate()?;

        Ok(Self {
            inner: Arc::new(Inner {
                name,
                semaphore: Semaphore::new(config.max_concurrent_calls as usize),
                config,
                in_flight: AtomicU32::new(0),
                rejected: AtomicU64::new(0),
                events: EventPublisher::new(),
            }),
        })
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.inner.config
    }

    /// Take a permit if one is free right now
    pub fn try_acquire_permission(&self) -> bool {
        match self.inner.semaphore.try_acquire() {
            Ok(permit) => {
                self.permitted(permit);
                true
            }
            Err(_) => {
                self.rejected();
                false
            }
        }
    }

    /// Take a permit, waiting up to `max_wait_duration` for one
    pub async fn acquire_permission(&self) -> bool {
        let max_wait = self.inner.config.max_wait_duration;
        if max_wait.is_zero() {
            return self.try_acquire_permission();
        }

        match tokio::time::timeout(max_wait, self.inner.semaphore.acquire()).await {
            Ok(Ok(permit)) => {
                self.permitted(permit);
                true
            }
            _ => {
                self.rejected();
                false
            }
        }
    }

    /// Return a permit taken by a successful acquire.
    ///
    /// Calls beyond the number of permits held are ignored.
    pub fn on_complete(&self) {
        let released = self
            .inner
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if !released {
            return;
        }

        self.inner.semaphore.add_permits(1);
        if self.inner.events.has_subscribers(BulkheadEventKind::CallFinished) {
            self.inner.events.publish(&BulkheadEvent::new(
                &self.inner.name,
                BulkheadEventKind::CallFinished,
            ));
        }
    }

    /// Execute an operation inside the bulkhead
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        if !self.acquire_permission().await {
            return Err(ResilienceError::BulkheadFull {
                name: self.inner.name.clone(),
            });
        }

        let _permit = CompletionGuard(self);
        op().await
    }

    /// Wrap `call` so that every invocation is admitted through this bulkhead
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
        let bulkhead = self.clone();
        let call = Arc::new(call);
        move || -> CallFuture<T, E> {
            let bulkhead = bulkhead.clone();
            let call = call.clone();
            Box::pin(async move { bulkhead.execute(|| (*call)()).await })
        }
    }

    /// Move a semaphore permit into the in-flight count.
    ///
    /// The count goes up before the permit leaves the semaphore, so
    /// `available + in_flight` never dips below `max_concurrent_calls`.
    fn permitted(&self, permit: SemaphorePermit<'_>) {
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        permit.forget();
        tracing::trace!(bulkhead = %self.inner.name, "Call permitted");
        if self.inner.events.has_subscribers(BulkheadEventKind::CallPermitted) {
            self.inner.events.publish(&BulkheadEvent::new(
                &self.inner.name,
                BulkheadEventKind::CallPermitted,
            ));
        }
    }

    fn rejected(&self) {
        self.inner.rejected.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            bulkhead = %self.inner.name,
            max_concurrent_calls = self.inner.config.max_concurrent_calls,
            "Bulkhead full"
        );
        if self.inner.events.has_subscribers(BulkheadEventKind::CallRejected) {
            self.inner.events.publish(&BulkheadEvent::new(
                &self.inner.name,
                BulkheadEventKind::CallRejected,
            ));
        }
    }
}

/// Releases the permit exactly once, even if the call future is dropped.
struct CompletionGuard<'a>(&'a Bulkhead);

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        self.0.on_complete();
    }
}

impl Policy for Bulkhead {
    type Metrics = BulkheadMetrics;
    type Event = BulkheadEvent;

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn metrics(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            available_concurrent_calls: self.inner.semaphore.available_permits() as u32,
            max_allowed_concurrent_calls: self.inner.config.max_concurrent_calls,
            rejected_calls: self.inner.rejected.load(Ordering::Relaxed),
        }
    }

    fn events(&self) -> &EventPublisher<BulkheadEvent> {
        &self.inner.events
    }
}
