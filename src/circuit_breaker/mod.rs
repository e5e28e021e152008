//! Circuit breaker with sliding-window statistics
//!
//! The breaker prevents cascading failures by failing fast while a
//! dependency is unhealthy. It moves between five states:
//! - Closed: calls pass through and their outcomes are recorded
//! - Open: every call is rejected with `CallNotPermitted`
//! - HalfOpen: a limited batch of trial calls decides between Closed and Open
//! - ForcedOpen / Disabled: manual states that reject or admit everything and
//!   are only left through an explicit transition
//!
//! Failure and slow-call rates come from a count-based or time-based sliding
//! window and are only defined once `minimum_number_of_calls` outcomes have
//! been recorded. Before that they read as -1.
//!
//! All state lives behind one short-held lock. Events are published after the
//! lock is released, in the order: call outcome, threshold exceeded, state
//! transition.

mod config;
mod window;

pub use config::{CircuitBreakerConfig, SlidingWindowType};

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::classify::{Classification, ErrorClassifier};
use crate::error::{ConfigurationError, Failure, ResilienceError};
use crate::event::{EventPublisher, PolicyEvent};
use crate::policy::{CallFuture, MetricsSnapshot, Policy};

use window::{CountWindow, Outcome, SlidingWindow, TimeWindow};

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
    /// Manually opened; no automatic transition out
    ForcedOpen,
    /// Manually disabled; admits everything and records nothing
    Disabled,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
            CircuitState::ForcedOpen => "FORCED_OPEN",
            CircuitState::Disabled => "DISABLED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitBreakerEventKind {
    Success,
    Error,
    IgnoredError,
    StateTransition,
    Reset,
    CallNotPermitted,
    FailureRateExceeded,
    SlowCallRateExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: CircuitState,
    pub to: CircuitState,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerEvent {
    pub policy_name: String,
    pub created_at: DateTime<Utc>,
    pub kind: CircuitBreakerEventKind,
    /// Call duration for outcome events
    pub elapsed: Option<Duration>,
    pub error: Option<String>,
    pub transition: Option<StateTransition>,
    /// Rate that tripped a threshold
    pub rate: Option<f32>,
}

impl PolicyEvent for CircuitBreakerEvent {
    type Kind = CircuitBreakerEventKind;

    fn kind(&self) -> CircuitBreakerEventKind {
        self.kind
    }

    fn policy_name(&self) -> &str {
        &self.policy_name
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    /// Percentage, or -1 below the minimum number of calls
    pub failure_rate: f32,
    /// Percentage, or -1 below the minimum number of calls
    pub slow_call_rate: f32,
    pub buffered_calls: u32,
    pub failed_calls: u32,
    pub slow_calls: u32,
    pub slow_failed_calls: u32,
    pub successful_calls: u32,
    pub not_permitted_calls: u64,
}

impl MetricsSnapshot for CircuitBreakerMetrics {
    fn counters(&self) -> BTreeMap<&'static str, f64> {
        BTreeMap::from([
            ("failure_rate", f64::from(self.failure_rate)),
            ("slow_call_rate", f64::from(self.slow_call_rate)),
            ("buffered_calls", f64::from(self.buffered_calls)),
            ("failed_calls", f64::from(self.failed_calls)),
            ("slow_calls", f64::from(self.slow_calls)),
            ("slow_failed_calls", f64::from(self.slow_failed_calls)),
            ("successful_calls", f64::from(self.successful_calls)),
            ("not_permitted_calls", self.not_permitted_calls as f64),
        ])
    }
}

/// Side effects decided under the lock and carried out after it is released.
#[derive(Debug)]
enum Notice {
    Transition {
        from: CircuitState,
        to: CircuitState,
        generation: u64,
    },
    FailureRateExceeded(f32),
    SlowCallRateExceeded(f32),
    Reset,
}

#[derive(Debug)]
struct Machine {
    state: CircuitState,
    window: SlidingWindow,
    /// Bumped on every transition; stale timers compare against it
    generation: u64,
    open_until: Option<Instant>,
    half_open_deadline: Option<Instant>,
    half_open_permits: u32,
}

#[derive(Debug)]
struct Inner {
    name: String,
    config: CircuitBreakerConfig,
    classifier: ErrorClassifier,
    machine: Mutex<Machine>,
    not_permitted: AtomicU64,
    events: EventPublisher<CircuitBreakerEvent>,
}

impl Inner {
    fn fresh_window(&self, now: Instant) -> SlidingWindow {
        let size = self.config.sliding_window_size;
        let minimum = self.config.minimum_number_of_calls;
        match self.config.sliding_window_type {
            SlidingWindowType::CountBased => SlidingWindow::Count(CountWindow::new(size, minimum)),
            SlidingWindowType::TimeBased => {
                SlidingWindow::Time(TimeWindow::new(size, minimum, now))
            }
        }
    }

    fn enter(&self, m: &mut Machine, to: CircuitState, now: Instant, notices: &mut Vec<Notice>) {
        let from = m.state;
        m.state = to;
        m.generation += 1;
        m.open_until = None;
        m.half_open_deadline = None;
        m.half_open_permits = 0;

        match to {
            CircuitState::Closed | CircuitState::ForcedOpen | CircuitState::Disabled => {
                m.window = self.fresh_window(now);
            }
            CircuitState::Open => {
                m.open_until = Some(now + self.config.wait_duration_in_open);
            }
            CircuitState::HalfOpen => {
                let permitted = self.config.permitted_calls_in_half_open;
                m.window = SlidingWindow::Count(CountWindow::new(permitted, permitted));
                m.half_open_permits = permitted;
                let max_wait = self.config.max_wait_duration_in_half_open;
                if !max_wait.is_zero() {
                    m.half_open_deadline = Some(now + max_wait);
                }
            }
        }

        notices.push(Notice::Transition {
            from,
            to,
            generation: m.generation,
        });
    }

    /// Apply time-driven transitions that are due.
    fn refresh(&self, m: &mut Machine, now: Instant, notices: &mut Vec<Notice>) {
        let state = m.state;
        match state {
            CircuitState::Open if m.open_until.is_some_and(|at| now >= at) => {
                self.enter(m, CircuitState::HalfOpen, now, notices);
            }
            CircuitState::HalfOpen if m.half_open_deadline.is_some_and(|at| now >= at) => {
                self.enter(m, CircuitState::Open, now, notices);
            }
            _ => {}
        }
    }

    fn evaluate(&self, m: &mut Machine, now: Instant, notices: &mut Vec<Notice>) {
        if !matches!(m.state, CircuitState::Closed | CircuitState::HalfOpen) {
            return;
        }

        let snapshot = m.window.snapshot(now);
        let failure_rate = snapshot.failure_rate();
        let slow_call_rate = snapshot.slow_call_rate();
        if failure_rate < 0.0 {
            return;
        }

        let failure_exceeded = failure_rate >= self.config.failure_rate_threshold;
        let slow_exceeded = slow_call_rate >= self.config.slow_call_rate_threshold;

        if failure_exceeded || slow_exceeded {
            if failure_exceeded {
                notices.push(Notice::FailureRateExceeded(failure_rate));
            }
            if slow_exceeded {
                notices.push(Notice::SlowCallRateExceeded(slow_call_rate));
            }
            self.enter(m, CircuitState::Open, now, notices);
        } else if m.state == CircuitState::HalfOpen {
            self.enter(m, CircuitState::Closed, now, notices);
        }
    }
}

/// Circuit breaker for protecting against cascading failures
///
/// # Example
/// ```no_run
/// use bulwark::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
/// use bulwark::ResilienceError;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let breaker = CircuitBreaker::new("inventory", CircuitBreakerConfig::default())?;
///
///     let result = breaker
///         .execute(|| async { Ok::<_, ResilienceError<std::io::Error>>(42) })
///         .await?;
///
///     println!("Result: {}", result);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Result<Self, ConfigurationError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConfigurationError::EmptyName);
        }
        config.validate()?;

        let classifier = config.classifier();
        let window = match config.sliding_window_type {
            SlidingWindowType::CountBased => SlidingWindow::Count(CountWindow::new(
                config.sliding_window_size,
                config.minimum_number_of_calls,
            )),
            SlidingWindowType::TimeBased => SlidingWindow::Time(TimeWindow::new(
                config.sliding_window_size,
                config.minimum_number_of_calls,
                Instant::now(),
            )),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                name,
                config,
                classifier,
                machine: Mutex::new(Machine {
                    state: CircuitState::Closed,
                    window,
                    generation: 0,
                    open_until: None,
                    half_open_deadline: None,
                    half_open_permits: 0,
                }),
                not_permitted: AtomicU64::new(0),
                events: EventPublisher::new(),
            }),
        })
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.inner.config
    }

    /// Current state, after applying any time-driven transition that is due
    pub fn state(&self) -> CircuitState {
        let mut notices = Vec::new();
        let state = {
            let mut m = self.inner.machine.lock();
            self.inner.refresh(&mut m, Instant::now(), &mut notices);
            m.state
        };
        self.flush(notices);
        state
    }

    /// Try to obtain permission for one call without running it.
    ///
    /// A refused probe fires `CallNotPermitted` and counts as a not-permitted
    /// call, exactly like a rejected `execute`. A granted permission must be
    /// followed by `on_success`/`on_error`/`on_result` or by
    /// `release_permission`.
    pub fn try_acquire_permission(&self) -> bool {
        self.acquire().is_ok()
    }

    /// Return a permission obtained but not used for a call
    pub fn release_permission(&self) {
        let mut m = self.inner.machine.lock();
        if m.state == CircuitState::HalfOpen {
            m.half_open_permits =
                (m.half_open_permits + 1).min(self.inner.config.permitted_calls_in_half_open);
        }
    }

    /// Record a successful call that took `elapsed`
    pub fn on_success(&self, elapsed: Duration) {
        if let Some(notices) = self.record(Outcome::new(false, self.is_slow(elapsed))) {
            self.publish(CircuitBreakerEventKind::Success, |e| {
                e.elapsed = Some(elapsed);
            });
            self.flush(notices);
        }
    }

    /// Record a failed call, classifying the failure first
    pub fn on_error(&self, elapsed: Duration, failure: &Failure<'_>) {
        match self.inner.classifier.classify(failure) {
            Classification::Ignored => {
                self.release_permission();
                tracing::debug!(
                    circuit_breaker = %self.inner.name,
                    error = %failure,
                    "Ignoring error"
                );
                if self.state() != CircuitState::Disabled {
                    self.publish(CircuitBreakerEventKind::IgnoredError, |e| {
                        e.elapsed = Some(elapsed);
                        e.error = Some(failure.to_string());
                    });
                }
            }
            Classification::Excluded => self.on_success(elapsed),
            Classification::Included => {
                let outcome = Outcome::new(true, self.is_slow(elapsed));
                if let Some(notices) = self.record(outcome) {
                    self.publish(CircuitBreakerEventKind::Error, |e| {
                        e.elapsed = Some(elapsed);
                        e.error = Some(failure.to_string());
                    });
                    self.flush(notices);
                }
            }
        }
    }

    /// Record a successful result, which `record_result` may turn into a failure
    pub fn on_result<T: 'static>(&self, elapsed: Duration, result: &T) {
        let recorded_as_failure = self
            .inner
            .config
            .record_result
            .as_ref()
            .is_some_and(|predicate| predicate.test(result));

        if !recorded_as_failure {
            self.on_success(elapsed);
            return;
        }

        if let Some(notices) = self.record(Outcome::new(true, self.is_slow(elapsed))) {
            self.publish(CircuitBreakerEventKind::Error, |e| {
                e.elapsed = Some(elapsed);
                e.error = Some("result recorded as failure".to_string());
            });
            self.flush(notices);
        }
    }

    /// Execute an operation with circuit breaker protection
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        T: 'static,
        E: StdError + 'static,
    {
        if let Err(state) = self.acquire() {
            return Err(ResilienceError::CallNotPermitted {
                name: self.inner.name.clone(),
                state,
            });
        }

        let permit = PermitGuard {
            breaker: self,
            armed: true,
        };
        let start = Instant::now();
        let result = op().await;
        let elapsed = start.elapsed();
        permit.disarm();

        match &result {
            Ok(value) => self.on_result(elapsed, value),
            Err(error) => self.on_error(elapsed, &error.failure()),
        }
        result
    }

    /// Wrap `call` so that every invocation goes through this breaker
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
        let breaker = self.clone();
        let call = Arc::new(call);
        move || -> CallFuture<T, E> {
            let breaker = breaker.clone();
            let call = call.clone();
            Box::pin(async move { breaker.execute(|| (*call)()).await })
        }
    }

    pub fn transition_to_closed(&self) {
        self.transition_to(CircuitState::Closed);
    }

    pub fn transition_to_open(&self) {
        self.transition_to(CircuitState::Open);
    }

    pub fn transition_to_half_open(&self) {
        self.transition_to(CircuitState::HalfOpen);
    }

    pub fn transition_to_forced_open(&self) {
        self.transition_to(CircuitState::ForcedOpen);
    }

    pub fn transition_to_disabled(&self) {
        self.transition_to(CircuitState::Disabled);
    }

    /// Move to `state` immediately; a no-op when already there
    pub fn transition_to(&self, state: CircuitState) {
        let mut notices = Vec::new();
        {
            let mut m = self.inner.machine.lock();
            if m.state == state {
                return;
            }
            self.inner.enter(&mut m, state, Instant::now(), &mut notices);
        }
        self.flush(notices);
    }

    /// Clear all statistics and return to CLOSED
    pub fn reset(&self) {
        let mut notices = Vec::new();
        {
            let mut m = self.inner.machine.lock();
            let from = m.state;
            self.inner
                .enter(&mut m, CircuitState::Closed, Instant::now(), &mut notices);
            if from == CircuitState::Closed {
                notices.clear();
            }
        }
        self.inner.not_permitted.store(0, Ordering::Relaxed);
        notices.push(Notice::Reset);
        self.flush(notices);
    }

    fn acquire(&self) -> Result<(), CircuitState> {
        let mut notices = Vec::new();
        let (permitted, state) = {
            let mut m = self.inner.machine.lock();
            self.inner.refresh(&mut m, Instant::now(), &mut notices);
            let permitted = match m.state {
                CircuitState::Closed | CircuitState::Disabled => true,
                CircuitState::Open | CircuitState::ForcedOpen => false,
                CircuitState::HalfOpen if m.half_open_permits > 0 => {
                    m.half_open_permits -= 1;
                    true
                }
                CircuitState::HalfOpen => false,
            };
            (permitted, m.state)
        };
        self.flush(notices);

        if permitted {
            return Ok(());
        }

        self.inner.not_permitted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            circuit_breaker = %self.inner.name,
            state = %state,
            "Call not permitted"
        );
        self.publish(CircuitBreakerEventKind::CallNotPermitted, |_| {});
        Err(state)
    }

    /// Insert an outcome and evaluate thresholds; `None` while disabled.
    fn record(&self, outcome: Outcome) -> Option<Vec<Notice>> {
        let mut notices = Vec::new();
        let mut m = self.inner.machine.lock();
        if m.state == CircuitState::Disabled {
            return None;
        }
        let now = Instant::now();
        m.window.record(outcome, now);
        self.inner.evaluate(&mut m, now, &mut notices);
        Some(notices)
    }

    fn is_slow(&self, elapsed: Duration) -> bool {
        elapsed > self.inner.config.slow_call_duration_threshold
    }

    fn flush(&self, notices: Vec<Notice>) {
        for notice in notices {
            match notice {
                Notice::Transition {
                    from,
                    to,
                    generation,
                } => {
                    if to == CircuitState::Open {
                        tracing::warn!(
                            circuit_breaker = %self.inner.name,
                            from = %from,
                            "Circuit breaker opened"
                        );
                    } else {
                        tracing::info!(
                            circuit_breaker = %self.inner.name,
                            from = %from,
                            to = %to,
                            "Circuit breaker state transition"
                        );
                    }
                    self.publish(CircuitBreakerEventKind::StateTransition, |e| {
                        e.transition = Some(StateTransition { from, to });
                    });
                    self.schedule(to, generation);
                }
                Notice::FailureRateExceeded(rate) => {
                    self.publish(CircuitBreakerEventKind::FailureRateExceeded, |e| {
                        e.rate = Some(rate);
                    });
                }
                Notice::SlowCallRateExceeded(rate) => {
                    self.publish(CircuitBreakerEventKind::SlowCallRateExceeded, |e| {
                        e.rate = Some(rate);
                    });
                }
                Notice::Reset => {
                    tracing::info!(circuit_breaker = %self.inner.name, "Circuit breaker reset");
                    self.publish(CircuitBreakerEventKind::Reset, |_| {});
                }
            }
        }
    }

    /// Arm the timer for the state just entered, if it has one.
    ///
    /// Outside a tokio runtime no timer is armed and the transition happens
    /// lazily on the next permission check.
    fn schedule(&self, state: CircuitState, generation: u64) {
        let config = &self.inner.config;
        let delay = match state {
            CircuitState::Open if config.automatic_transition_from_open_to_half_open => {
                config.wait_duration_in_open
            }
            CircuitState::HalfOpen if !config.max_wait_duration_in_half_open.is_zero() => {
                config.max_wait_duration_in_half_open
            }
            _ => return,
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let inner = Arc::downgrade(&self.inner);
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                CircuitBreaker { inner }.on_timer(generation);
            }
        });
    }

    fn on_timer(&self, generation: u64) {
        let mut notices = Vec::new();
        {
            let mut m = self.inner.machine.lock();
            if m.generation != generation {
                return;
            }
            let now = Instant::now();
            match m.state {
                CircuitState::Open => {
                    self.inner.enter(&mut m, CircuitState::HalfOpen, now, &mut notices)
                }
                CircuitState::HalfOpen => {
                    self.inner.enter(&mut m, CircuitState::Open, now, &mut notices)
                }
                _ => {}
            }
        }
        self.flush(notices);
    }

    fn publish(&self, kind: CircuitBreakerEventKind, fill: impl FnOnce(&mut CircuitBreakerEvent)) {
        if !self.inner.events.has_subscribers(kind) {
            return;
        }
        let mut event = CircuitBreakerEvent {
            policy_name: self.inner.name.clone(),
            created_at: Utc::now(),
            kind,
            elapsed: None,
            error: None,
            transition: None,
            rate: None,
        };
        fill(&mut event);
        self.inner.events.publish(&event);
    }
}

/// Returns the permission if the call future is dropped before completing.
struct PermitGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl PermitGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_permission();
        }
    }
}

impl Policy for CircuitBreaker {
    type Metrics = CircuitBreakerMetrics;
    type Event = CircuitBreakerEvent;

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn metrics(&self) -> CircuitBreakerMetrics {
        let mut notices = Vec::new();
        let (state, snapshot) = {
            let mut m = self.inner.machine.lock();
            let now = Instant::now();
            self.inner.refresh(&mut m, now, &mut notices);
            let snapshot = m.window.snapshot(now);
            (m.state, snapshot)
        };
        self.flush(notices);
        CircuitBreakerMetrics {
            state,
            failure_rate: snapshot.failure_rate(),
            slow_call_rate: snapshot.slow_call_rate(),
            buffered_calls: snapshot.total_calls,
            failed_calls: snapshot.failed_calls,
            slow_calls: snapshot.slow_calls,
            slow_failed_calls: snapshot.slow_failed_calls,
            successful_calls: snapshot.successful_calls(),
            not_permitted_calls: self.inner.not_permitted.load(Ordering::Relaxed),
        }
    }

    fn events(&self) -> &EventPublisher<CircuitBreakerEvent> {
        &self.inner.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{ErrorPredicate, ResultPredicate};
    use std::io;
    use std::sync::atomic::AtomicU32;

    type TestResult<T> = Result<T, ResilienceError<io::Error>>;

    fn breaker(config: CircuitBreakerConfig) -> CircuitBreaker {
        CircuitBreaker::new("test", config).unwrap()
    }

    fn small(minimum: u32, threshold: f32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            minimum_number_of_calls: minimum,
            sliding_window_size: minimum,
            failure_rate_threshold: threshold,
            wait_duration_in_open: Duration::from_secs(10),
            ..Default::default()
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> TestResult<()> {
        breaker
            .execute(|| async { Err(ResilienceError::Call(io::Error::other("boom"))) })
            .await
    }

    async fn fail_with(breaker: &CircuitBreaker, kind: io::ErrorKind) -> TestResult<()> {
        breaker
            .execute(|| async move { Err(ResilienceError::Call(io::Error::new(kind, "boom"))) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> TestResult<()> {
        breaker.execute(|| async { Ok(()) }).await
    }

    fn record_kinds(breaker: &CircuitBreaker) -> Arc<Mutex<Vec<CircuitBreakerEventKind>>> {
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let seen = kinds.clone();
        breaker
            .events()
            .on_event(move |e: &CircuitBreakerEvent| seen.lock().push(e.kind));
        kinds
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
        assert_eq!(CircuitState::ForcedOpen.to_string(), "FORCED_OPEN");
        assert_eq!(
            serde_json::to_value(CircuitState::Closed).unwrap(),
            serde_json::json!("CLOSED")
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = CircuitBreaker::new("", CircuitBreakerConfig::default()).unwrap_err();
        assert_eq!(err, ConfigurationError::EmptyName);
        assert!(CircuitBreaker::new("cb", small(4, 0.0)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_failure_rate_threshold() {
        let cb = breaker(CircuitBreakerConfig {
            minimum_number_of_calls: 4,
            failure_rate_threshold: 25.0,
            sliding_window_size: 10,
            ..Default::default()
        });

        assert!(fail(&cb).await.is_err());
        succeed(&cb).await.unwrap();
        succeed(&cb).await.unwrap();
        assert_eq!(cb.metrics().failure_rate, -1.0);
        assert_eq!(cb.state(), CircuitState::Closed);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.metrics().failure_rate, 25.0);

        let invoked = AtomicU32::new(0);
        let err = cb
            .execute(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { TestResult::Ok(()) }
            })
            .await
            .unwrap_err();
        assert!(err.is_call_not_permitted());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(cb.metrics().not_permitted_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_below_minimum_never_opens() {
        let cb = breaker(CircuitBreakerConfig {
            minimum_number_of_calls: 4,
            failure_rate_threshold: 25.0,
            ..Default::default()
        });
        for _ in 0..3 {
            assert!(fail(&cb).await.is_err());
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().failure_rate, -1.0);
        assert_eq!(cb.metrics().failed_calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_wait_then_closes() {
        let cb = breaker(CircuitBreakerConfig {
            permitted_calls_in_half_open: 2,
            ..small(2, 50.0)
        });
        assert!(fail(&cb).await.is_err());
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(succeed(&cb).await.unwrap_err().is_call_not_permitted());

        tokio::time::advance(Duration::from_secs(5)).await;
        // reading the state applies the due transition
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().buffered_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_apply_due_transition() {
        let cb = breaker(small(1, 50.0));
        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();
        cb.events()
            .on(CircuitBreakerEventKind::StateTransition, move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            });

        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.metrics().state, CircuitState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        let metrics = cb.metrics();
        assert_eq!(metrics.state, CircuitState::HalfOpen);
        assert_eq!(metrics.buffered_calls, 0);
        assert_eq!(seen.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failures_reopen() {
        let cb = breaker(CircuitBreakerConfig {
            permitted_calls_in_half_open: 2,
            ..small(2, 50.0)
        });
        cb.transition_to_open();
        tokio::time::advance(Duration::from_secs(10)).await;

        succeed(&cb).await.unwrap();
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_trial_calls() {
        let cb = breaker(CircuitBreakerConfig {
            permitted_calls_in_half_open: 1,
            ..small(2, 50.0)
        });
        cb.transition_to_half_open();

        assert!(cb.try_acquire_permission());
        assert!(!cb.try_acquire_permission());
        assert_eq!(cb.metrics().not_permitted_calls, 1);

        cb.release_permission();
        assert!(cb.try_acquire_permission());
    }

    #[tokio::test(start_paused = true)]
    async fn test_automatic_transition_to_half_open() {
        let cb = breaker(CircuitBreakerConfig {
            automatic_transition_from_open_to_half_open: true,
            wait_duration_in_open: Duration::from_secs(5),
            ..small(1, 50.0)
        });
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_wait_in_half_open_forces_open() {
        let cb = breaker(CircuitBreakerConfig {
            permitted_calls_in_half_open: 3,
            max_wait_duration_in_half_open: Duration::from_secs(2),
            ..small(1, 50.0)
        });
        cb.transition_to_half_open();
        assert!(cb.try_acquire_permission());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_order_on_trip() {
        let cb = breaker(small(1, 50.0));
        let kinds = record_kinds(&cb);

        assert!(fail(&cb).await.is_err());
        assert!(succeed(&cb).await.is_err());
        assert_eq!(
            *kinds.lock(),
            vec![
                CircuitBreakerEventKind::Error,
                CircuitBreakerEventKind::FailureRateExceeded,
                CircuitBreakerEventKind::StateTransition,
                CircuitBreakerEventKind::CallNotPermitted,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_calls_open_circuit() {
        let cb = breaker(CircuitBreakerConfig {
            slow_call_duration_threshold: Duration::from_secs(1),
            slow_call_rate_threshold: 50.0,
            ..small(2, 50.0)
        });
        let rates = Arc::new(Mutex::new(Vec::new()));
        let seen = rates.clone();
        cb.events()
            .on(CircuitBreakerEventKind::SlowCallRateExceeded, move |e| {
                seen.lock().extend(e.rate);
            });

        for _ in 0..2 {
            cb.execute(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                TestResult::Ok(())
            })
            .await
            .unwrap();
        }

        assert_eq!(cb.state(), CircuitState::Open);
        let metrics = cb.metrics();
        assert_eq!(metrics.slow_calls, 2);
        assert_eq!(metrics.failed_calls, 0);
        assert_eq!(metrics.slow_call_rate, 100.0);
        assert_eq!(*rates.lock(), vec![100.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_errors_are_not_recorded() {
        let cb = breaker(CircuitBreakerConfig {
            ignore_errors: vec![ErrorPredicate::matching(|e: &io::Error| {
                e.kind() == io::ErrorKind::NotFound
            })],
            ..small(1, 50.0)
        });
        let kinds = record_kinds(&cb);

        assert!(fail_with(&cb, io::ErrorKind::NotFound).await.is_err());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().buffered_calls, 0);
        assert_eq!(*kinds.lock(), vec![CircuitBreakerEventKind::IgnoredError]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecorded_errors_count_as_success() {
        let cb = breaker(CircuitBreakerConfig {
            record_errors: vec![ErrorPredicate::matching(|e: &io::Error| {
                e.kind() == io::ErrorKind::NotConnected
            })],
            ..small(1, 50.0)
        });

        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().successful_calls, 1);

        assert!(fail_with(&cb, io::ErrorKind::NotConnected).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_result_counts_as_failure() {
        let cb = breaker(CircuitBreakerConfig {
            record_result: Some(ResultPredicate::new(|v: &i32| *v < 0)),
            ..small(1, 50.0)
        });

        let value: TestResult<i32> = cb.execute(|| async { Ok(-1) }).await;
        assert_eq!(value.unwrap(), -1);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_states_do_not_auto_transition() {
        let cb = breaker(small(1, 50.0));

        cb.transition_to_forced_open();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(succeed(&cb).await.unwrap_err().is_call_not_permitted());
        assert_eq!(cb.state(), CircuitState::ForcedOpen);

        cb.transition_to_disabled();
        for _ in 0..5 {
            assert!(fail(&cb).await.is_err());
        }
        assert_eq!(cb.state(), CircuitState::Disabled);
        assert_eq!(cb.metrics().buffered_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_statistics() {
        let cb = breaker(small(1, 50.0));
        assert!(fail(&cb).await.is_err());
        assert!(succeed(&cb).await.is_err());
        let kinds = record_kinds(&cb);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        let metrics = cb.metrics();
        assert_eq!(metrics.buffered_calls, 0);
        assert_eq!(metrics.not_permitted_calls, 0);
        assert_eq!(
            *kinds.lock(),
            vec![
                CircuitBreakerEventKind::StateTransition,
                CircuitBreakerEventKind::Reset
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_call_releases_trial_permit() {
        let cb = breaker(CircuitBreakerConfig {
            permitted_calls_in_half_open: 1,
            ..small(1, 50.0)
        });
        cb.transition_to_half_open();

        let pending = cb.execute(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            TestResult::Ok(())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());

        assert!(cb.try_acquire_permission());
    }

    #[tokio::test]
    async fn test_instances_are_independent() {
        let a = breaker(small(1, 50.0));
        let b = breaker(small(1, 50.0));
        assert!(fail(&a).await.is_err());
        assert_eq!(a.state(), CircuitState::Open);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.metrics().buffered_calls, 0);
    }
}
