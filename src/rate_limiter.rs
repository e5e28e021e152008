//! Rate limiting for preventing service overload
//!
//! Time is divided into cycles of `limit_refresh_period`; every cycle grants
//! `limit_for_period` permits and unused permits do not carry over. A caller
//! that finds no permit computes how long it would have to wait for one. If
//! that wait fits within `timeout_duration` it *reserves* the permit right
//! away (the available count may go negative) and sleeps until its cycle
//! starts; otherwise it fails immediately without consuming anything.
//! Reserving under the same lock that computes the wait is what stops two
//! racing callers from both being promised the same future permit.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::{ConfigurationError, ResilienceError};
use crate::event::{EventPublisher, PolicyEvent};
use crate::policy::{CallFuture, MetricsSnapshot, Policy};

/// Configuration for rate limiter behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Permits granted per refresh period
    pub limit_for_period: u32,
    /// Length of one refresh period
    pub limit_refresh_period: Duration,
    /// Longest a caller may wait for a permit (zero = never wait)
    pub timeout_duration: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            limit_for_period: 50,
            limit_refresh_period: Duration::from_nanos(500),
            timeout_duration: Duration::from_secs(5),
        }
    }
}

impl RateLimiterConfig {
    /// `requests` permits per second, never waiting
    pub fn per_second(requests: u32) -> Self {
        Self {
            limit_for_period: requests,
            limit_refresh_period: Duration::from_secs(1),
            timeout_duration: Duration::ZERO,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.limit_for_period == 0 {
            return Err(ConfigurationError::NotPositive {
                field: "limit_for_period",
            });
        }
        if self.limit_refresh_period.is_zero() {
            return Err(ConfigurationError::NotPositive {
                field: "limit_refresh_period",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimiterEventKind {
    Success,
    Failure,
}

#[derive(Debug, Clone)]
pub struct RateLimiterEvent {
    pub policy_name: String,
    pub created_at: DateTime<Utc>,
    pub kind: RateLimiterEventKind,
    /// Permits requested
    pub permits: u32,
}

impl PolicyEvent for RateLimiterEvent {
    type Kind = RateLimiterEventKind;

    fn kind(&self) -> RateLimiterEventKind {
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
pub struct RateLimiterMetrics {
    /// Estimate; negative when waiters hold reservations
    pub available_permissions: i64,
    /// Estimate of callers currently sleeping on a reservation
    pub number_of_waiting_threads: usize,
    pub successful_acquisitions: u64,
    pub failed_acquisitions: u64,
}

impl MetricsSnapshot for RateLimiterMetrics {
    fn counters(&self) -> BTreeMap<&'static str, f64> {
        BTreeMap::from([
            ("available_permissions", self.available_permissions as f64),
            ("number_of_waiting_threads", self.number_of_waiting_threads as f64),
            ("successful_acquisitions", self.successful_acquisitions as f64),
            ("failed_acquisitions", self.failed_acquisitions as f64),
        ])
    }
}

/// Permit bookkeeping for the current cycle
#[derive(Debug, Clone, Copy)]
struct CycleState {
    active_cycle: u64,
    active_permissions: i64,
}

/// Outcome of one reservation attempt
#[derive(Debug, Clone, Copy)]
struct Reservation {
    wait: Duration,
    granted: bool,
}

#[derive(Debug)]
struct Inner {
    name: String,
    config: RateLimiterConfig,
    started_at: Instant,
    state: Mutex<CycleState>,
    waiting: AtomicUsize,
    successful: AtomicU64,
    failed: AtomicU64,
    events: EventPublisher<RateLimiterEvent>,
}

impl Inner {
    fn cycle_nanos(&self) -> u64 {
        (self.config.limit_refresh_period.as_nanos() as u64).max(1)
    }

    fn elapsed_nanos(&self) -> u64 {
        Instant::now().duration_since(self.started_at).as_nanos() as u64
    }

    /// Roll `state` forward to the cycle containing `now_nanos`.
    fn refresh(&self, state: &mut CycleState, now_nanos: u64) {
        let current_cycle = now_nanos / self.cycle_nanos();
        if current_cycle != state.active_cycle {
            let elapsed_cycles = current_cycle.saturating_sub(state.active_cycle);
            let per_cycle = i64::from(self.config.limit_for_period);
            let accumulated = (elapsed_cycles as i64).saturating_mul(per_cycle);
            state.active_cycle = current_cycle;
            state.active_permissions = state
                .active_permissions
                .saturating_add(accumulated)
                .min(per_cycle);
        }
    }

    /// Time until `permits` become available, given the refreshed state.
    ///
    /// A wait too long to represent comes back as `Duration::MAX`.
    fn wait_for(&self, state: &CycleState, permits: u32, now_nanos: u64) -> Duration {
        let permits = i64::from(permits);
        if state.active_permissions >= permits {
            return Duration::ZERO;
        }

        let cycle = self.cycle_nanos();
        let per_cycle = i64::from(self.config.limit_for_period);
        let next_cycle_start = state.active_cycle.saturating_add(1).saturating_mul(cycle);
        let nanos_to_next_cycle = next_cycle_start.saturating_sub(now_nanos);
        let at_next_cycle = state.active_permissions.saturating_add(per_cycle);
        let deficit = permits.saturating_sub(at_next_cycle).max(0);
        let full_cycles = (deficit.saturating_add(per_cycle - 1) / per_cycle) as u64;

        full_cycles
            .checked_mul(cycle)
            .and_then(|nanos| nanos.checked_add(nanos_to_next_cycle))
            .map(Duration::from_nanos)
            .unwrap_or(Duration::MAX)
    }

    fn reserve(&self, permits: u32, timeout: Duration) -> Reservation {
        let now = self.elapsed_nanos();
        let mut state = self.state.lock();
        self.refresh(&mut state, now);

        let wait = self.wait_for(&state, permits, now);
        let granted = wait != Duration::MAX && wait <= timeout;
        if granted {
            state.active_permissions -= i64::from(permits);
        }
        Reservation { wait, granted }
    }
}

/// Decrements the waiting-caller estimate even if the waiting future is dropped
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Fixed-window rate limiter with bounded waiting
///
/// # Example
/// ```no_run
/// use bulwark::rate_limiter::{RateLimiter, RateLimiterConfig};
/// use bulwark::ResilienceError;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     // Allow 100 requests per second
///     let limiter = RateLimiter::new("api", RateLimiterConfig::per_second(100))?;
///
///     limiter.execute(|| async {
///         Ok::<_, ResilienceError<std::io::Error>>(42)
///     }).await?;
///
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    /// Create a new rate limiter; the first cycle starts now with a full
    /// allowance of permits
    pub fn new(
        name: impl Into<String>,
        config: RateLimiterConfig,
    ) -> Result<Self, ConfigurationError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConfigurationError::EmptyName);
        }
        config.validate()?;

        let initial = CycleState {
            active_cycle: 0,
            active_permissions: i64::from(config.limit_for_period),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                name,
                config,
                started_at: Instant::now(),
                state: Mutex::new(initial),
                waiting: AtomicUsize::new(0),
                successful: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                events: EventPublisher::new(),
            }),
        })
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.inner.config
    }

    /// Acquire `permits`, waiting up to `timeout_duration` for them.
    ///
    /// Returns `false` without consuming anything if they cannot be
    /// obtained in time.
    pub async fn acquire_permission(&self, permits: u32) -> bool {
        let reservation = self.inner.reserve(permits, self.inner.config.timeout_duration);
        if !reservation.granted {
            self.record_failure(permits);
            return false;
        }

        if !reservation.wait.is_zero() {
            let _waiting = WaitingGuard::enter(&self.inner.waiting);
            tracing::debug!(
                rate_limiter = %self.inner.name,
                wait_ms = reservation.wait.as_millis() as u64,
                "Waiting for reserved permit"
            );
            tokio::time::sleep(reservation.wait).await;
        }

        self.record_success(permits);
        true
    }

    /// Reserve `permits` without waiting.
    ///
    /// Returns how long the caller must wait before using them, or `None`
    /// if that wait would exceed `timeout_duration` (nothing is reserved).
    pub fn reserve_permission(&self, permits: u32) -> Option<Duration> {
        let reservation = self.inner.reserve(permits, self.inner.config.timeout_duration);
        if reservation.granted {
            self.record_success(permits);
            Some(reservation.wait)
        } else {
            self.record_failure(permits);
            None
        }
    }

    /// Discard the rest of this cycle's permits; reservations are kept.
    pub fn drain_permissions(&self) {
        let now = self.inner.elapsed_nanos();
        let mut state = self.inner.state.lock();
        self.inner.refresh(&mut state, now);
        state.active_permissions = state.active_permissions.min(0);
    }

    /// Execute an operation once a permit is available
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        if !self.acquire_permission(1).await {
            return Err(ResilienceError::RateLimitExceeded {
                name: self.inner.name.clone(),
            });
        }
        op().await
    }

    /// Wrap `call` so that every invocation first acquires a permit
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

    fn record_success(&self, permits: u32) {
        self.inner.successful.fetch_add(1, Ordering::Relaxed);
        self.publish(RateLimiterEventKind::Success, permits);
    }

    fn record_failure(&self, permits: u32) {
        self.inner.failed.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            rate_limiter = %self.inner.name,
            permits,
            "Rate limit exceeded"
        );
        self.publish(RateLimiterEventKind::Failure, permits);
    }

    fn publish(&self, kind: RateLimiterEventKind, permits: u32) {
        if !self.inner.events.has_subscribers(kind) {
            return;
        }
        self.inner.events.publish(&RateLimiterEvent {
            policy_name: self.inner.name.clone(),
            created_at: Utc::now(),
            kind,
            permits,
        });
    }
}

impl Policy for RateLimiter {
    type Metrics = RateLimiterMetrics;
    type Event = RateLimiterEvent;

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn metrics(&self) -> RateLimiterMetrics {
        let now = self.inner.elapsed_nanos();
        let mut projected = *self.inner.state.lock();
        self.inner.refresh(&mut projected, now);

        RateLimiterMetrics {
            available_permissions: projected.active_permissions,
            number_of_waiting_threads: self.inner.waiting.load(Ordering::Relaxed),
            successful_acquisitions: self.inner.successful.load(Ordering::Relaxed),
            failed_acquisitions: self.inner.failed.load(Ordering::Relaxed),
        }
    }

    fn events(&self) -> &EventPublisher<RateLimiterEvent> {
        &self.inner.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    type TestResult<T> = Result<T, ResilienceError<io::Error>>;

    fn limiter(limit: u32, period: Duration, timeout: Duration) -> RateLimiter {
        RateLimiter::new(
            "test",
            RateLimiterConfig {
                limit_for_period: limit,
                limit_refresh_period: period,
                timeout_duration: timeout,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_rate_limiter_config() {
        let config = RateLimiterConfig::per_second(100);
        assert_eq!(config.limit_for_period, 100);
        assert_eq!(config.limit_refresh_period, Duration::from_secs(1));

        let err = RateLimiter::new(
            "test",
            RateLimiterConfig {
                limit_for_period: 0,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::NotPositive {
                field: "limit_for_period"
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_without_waiting_then_refreshes() {
        let limiter = limiter(1, Duration::from_millis(50), Duration::ZERO);

        let first: TestResult<u32> = limiter.execute(|| async { Ok(1) }).await;
        assert_eq!(first.unwrap(), 1);

        let second: TestResult<u32> = limiter.execute(|| async { Ok(2) }).await;
        assert!(second.unwrap_err().is_rate_limit_exceeded());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let third: TestResult<u32> = limiter.execute(|| async { Ok(3) }).await;
        assert_eq!(third.unwrap(), 3);

        let metrics = limiter.metrics();
        assert_eq!(metrics.successful_acquisitions, 2);
        assert_eq!(metrics.failed_acquisitions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unused_permits_do_not_carry_over() {
        let limiter = limiter(3, Duration::from_millis(10), Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(limiter.metrics().available_permissions, 3);
        for _ in 0..3 {
            assert!(limiter.acquire_permission(1).await);
        }
        assert!(!limiter.acquire_permission(1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_reserves_next_cycle() {
        let limiter = limiter(1, Duration::from_millis(100), Duration::from_millis(500));
        assert!(limiter.acquire_permission(1).await);

        let wait = limiter.reserve_permission(1).unwrap();
        assert!(wait > Duration::ZERO && wait <= Duration::from_millis(100));
        assert_eq!(limiter.metrics().available_permissions, -1);

        // The next caller has to wait a further full cycle behind the reservation.
        let later = limiter.reserve_permission(1).unwrap();
        assert!(later > wait);
        assert_eq!(limiter.metrics().available_permissions, -2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_beyond_timeout_consumes_nothing() {
        let limiter = limiter(1, Duration::from_secs(1), Duration::from_millis(100));
        assert!(limiter.acquire_permission(1).await);

        assert!(limiter.reserve_permission(1).is_none());
        assert_eq!(limiter.metrics().available_permissions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_wait_is_refused() {
        let limiter = limiter(1, Duration::from_secs(10), Duration::from_millis(1));

        assert!(limiter.reserve_permission(u32::MAX).is_none());
        assert_eq!(limiter.metrics().available_permissions, 1);
        assert!(!limiter.acquire_permission(u32::MAX).await);
        assert!(limiter.acquire_permission(1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_caller_proceeds_after_refresh() {
        let limiter = limiter(1, Duration::from_millis(50), Duration::from_millis(200));
        assert!(limiter.acquire_permission(1).await);

        let start = Instant::now();
        assert!(limiter.acquire_permission(1).await);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(limiter.metrics().number_of_waiting_threads, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_never_share_a_permit() {
        let limiter = limiter(5, Duration::from_secs(60), Duration::ZERO);
        let mut handles = Vec::new();
        for _ in 0..200 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.acquire_permission(1).await }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);

        let metrics = limiter.metrics();
        assert_eq!(metrics.successful_acquisitions, 5);
        assert_eq!(metrics.failed_acquisitions, 195);
        assert_eq!(metrics.available_permissions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_permissions() {
        let limiter = limiter(10, Duration::from_secs(1), Duration::ZERO);
        limiter.drain_permissions();
        assert_eq!(limiter.metrics().available_permissions, 0);
        assert!(!limiter.acquire_permission(1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events() {
        let limiter = limiter(1, Duration::from_secs(1), Duration::ZERO);
        let failures = Arc::new(AtomicU64::new(0));
        let counter = failures.clone();
        limiter.events().on(RateLimiterEventKind::Failure, move |event| {
            assert_eq!(event.policy_name, "test");
            counter.fetch_add(1, Ordering::Relaxed);
        });

        assert!(limiter.acquire_permission(1).await);
        assert!(!limiter.acquire_permission(1).await);
        assert!(!limiter.acquire_permission(1).await);
        assert_eq!(failures.load(Ordering::Relaxed), 2);
    }
}
