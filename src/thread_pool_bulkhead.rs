//! Thread-pool bulkhead
//!
//! Runs synchronous work on a bounded pool of OS threads with a bounded
//! queue. Submitting never blocks: the work is either admitted and a
//! [`BulkheadFuture`] returned at once, or rejected with
//! [`ResilienceError::BulkheadFull`].
//!
//! Admission order for each submission:
//! 1. an idle worker is waiting: hand the task to it
//! 2. the pool is below `max_thread_pool_size`: start a worker for the task
//! 3. the queue has room: enqueue
//! 4. otherwise reject
//!
//! Workers above `core_thread_pool_size` exit after `keep_alive_duration`
//! without work. Thread-local context of the submitter is not carried over
//! to the worker.
//!
//! The pool is never torn down implicitly. Owners call
//! [`ThreadPoolBulkhead::shutdown`] and [`ThreadPoolBulkhead::await_termination`]
//! when the process winds down.

use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::error::Error as StdError;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::bulkhead::{BulkheadEvent, BulkheadEventKind};
use crate::error::{ConfigurationError, ResilienceError};
use crate::event::EventPublisher;
use crate::policy::{CallFuture, MetricsSnapshot, Policy};

/// Configuration for the thread-pool bulkhead
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadPoolBulkheadConfig {
    pub max_thread_pool_size: usize,
    /// Workers kept alive while idle
    pub core_thread_pool_size: usize,
    /// Tasks that may wait for a worker; zero disables queueing
    pub queue_capacity: usize,
    /// Idle time after which a worker above the core size exits
    pub keep_alive_duration: Duration,
}

impl Default for ThreadPoolBulkheadConfig {
    fn default() -> Self {
        let max = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            max_thread_pool_size: max,
            core_thread_pool_size: max.saturating_sub(1).max(1),
            queue_capacity: 100,
            keep_alive_duration: Duration::from_millis(20),
        }
    }
}

impl ThreadPoolBulkheadConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_thread_pool_size == 0 {
            return Err(ConfigurationError::NotPositive {
                field: "max_thread_pool_size",
            });
        }
        if self.core_thread_pool_size == 0 {
            return Err(ConfigurationError::NotPositive {
                field: "core_thread_pool_size",
            });
        }
        if self.core_thread_pool_size > self.max_thread_pool_size {
            return Err(ConfigurationError::Ordering {
                lower: "core_thread_pool_size",
                lower_value: self.core_thread_pool_size as u64,
                upper: "max_thread_pool_size",
                upper_value: self.max_thread_pool_size as u64,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThreadPoolBulkheadMetrics {
    pub core_thread_pool_size: usize,
    pub thread_pool_size: usize,
    pub maximum_thread_pool_size: usize,
    /// Tasks waiting for a worker
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub remaining_queue_capacity: usize,
    pub rejected_calls: u64,
}

impl MetricsSnapshot for ThreadPoolBulkheadMetrics {
    fn counters(&self) -> BTreeMap<&'static str, f64> {
        BTreeMap::from([
            ("core_thread_pool_size", self.core_thread_pool_size as f64),
            ("thread_pool_size", self.thread_pool_size as f64),
            ("maximum_thread_pool_size", self.maximum_thread_pool_size as f64),
            ("queue_depth", self.queue_depth as f64),
            ("queue_capacity", self.queue_capacity as f64),
            ("remaining_queue_capacity", self.remaining_queue_capacity as f64),
            ("rejected_calls", self.rejected_calls as f64),
        ])
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    tasks: VecDeque<Job>,
    /// Admitted tasks not yet pushed onto `tasks`
    reserved: usize,
    /// Workers parked waiting for a task
    idle: usize,
    workers: usize,
    spawned: u64,
    shutdown: bool,
    handles: Vec<JoinHandle<()>>,
}

impl PoolState {
    /// Queued tasks not already claimed by a parked worker
    fn queue_depth(&self) -> usize {
        self.pending().saturating_sub(self.idle)
    }

    fn pending(&self) -> usize {
        self.tasks.len() + self.reserved
    }
}

enum Admission {
    /// An idle worker will take the task from the queue
    Handoff,
    Spawn(u64),
    Enqueue,
}

struct Inner {
    name: String,
    config: ThreadPoolBulkheadConfig,
    state: Mutex<PoolState>,
    work_available: Condvar,
    terminated: Condvar,
    rejected: AtomicU64,
    events: EventPublisher<BulkheadEvent>,
}

impl Inner {
    fn reject(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        self.publish(BulkheadEventKind::CallRejected);
    }

    fn publish(&self, kind: BulkheadEventKind) {
        if self.events.has_subscribers(kind) {
            self.events.publish(&BulkheadEvent::new(&self.name, kind));
        }
    }
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ThreadPoolBulkhead")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("workers", &state.workers)
            .field("queued", &state.tasks.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

/// Bounded worker pool with a bounded queue
///
/// # Example
/// ```no_run
/// use bulwark::thread_pool_bulkhead::{ThreadPoolBulkhead, ThreadPoolBulkheadConfig};
/// use bulwark::ResilienceError;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = ThreadPoolBulkhead::new("reports", ThreadPoolBulkheadConfig::default())?;
///
/// let future = pool.submit(|| Ok::<_, ResilienceError<std::io::Error>>(2 + 2))?;
/// assert_eq!(future.wait()?, 4);
///
/// pool.shutdown();
/// pool.await_termination(std::time::Duration::from_secs(5));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ThreadPoolBulkhead {
    inner: Arc<Inner>,
}

impl ThreadPoolBulkhead {
    pub fn new(
        name: impl Into<String>,
        config: ThreadPoolBulkheadConfig,
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
                state: Mutex::new(PoolState {
                    tasks: VecDeque::new(),
                    reserved: 0,
                    idle: 0,
                    workers: 0,
                    spawned: 0,
                    shutdown: false,
                    handles: Vec::new(),
                }),
                work_available: Condvar::new(),
                terminated: Condvar::new(),
                rejected: AtomicU64::new(0),
                events: EventPublisher::new(),
            }),
        })
    }

    pub fn config(&self) -> &ThreadPoolBulkheadConfig {
        &self.inner.config
    }

    /// Submit work to the pool without blocking.
    ///
    /// A panic inside `task` resolves the future with
    /// [`ResilienceError::Aborted`]; the worker survives.
    pub fn submit<F, T, E>(&self, task: F) -> Result<BulkheadFuture<T, E>, ResilienceError<E>>
    where
        F: FnOnce() -> Result<T, ResilienceError<E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(task)).unwrap_or_else(|payload| {
                Err(ResilienceError::Aborted(panic_message(payload.as_ref())))
            });
            // The caller may have dropped the future; the result is discarded then.
            let _ = tx.send(outcome);
        });

        self.admit(job)?;
        Ok(BulkheadFuture { rx })
    }

    /// Wrap `call` so that every invocation is submitted to this pool
    pub fn decorate<F, T, E>(
        &self,
        call: F,
    ) -> impl Fn() -> CallFuture<T, E> + Clone + Send + Sync + 'static
    where
        F: Fn() -> Result<T, ResilienceError<E>> + Send + Sync + 'static,
        T: Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        let pool = self.clone();
        let call = Arc::new(call);
        move || -> CallFuture<T, E> {
            let call = call.clone();
            match pool.submit(move || (*call)()) {
                Ok(future) => Box::pin(future),
                Err(rejected) => Box::pin(futures::future::ready(Err(rejected))),
            }
        }
    }

    /// Stop admitting work; queued tasks still run
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }
        tracing::info!(thread_pool_bulkhead = %self.inner.name, "Shutting down worker pool");
        self.inner.work_available.notify_all();
    }

    /// Block until every worker has exited or `timeout` elapses.
    ///
    /// Returns `true` once the pool is fully terminated. Only meaningful
    /// after [`shutdown`](Self::shutdown).
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let handles = {
            let mut state = self.inner.state.lock();
            while state.workers > 0 {
                if self
                    .inner
                    .terminated
                    .wait_until(&mut state, deadline)
                    .timed_out()
                {
                    if state.workers > 0 {
                        return false;
                    }
                    break;
                }
            }
            std::mem::take(&mut state.handles)
        };

        for handle in handles {
            if handle.join().is_err() {
                tracing::error!(
                    thread_pool_bulkhead = %self.inner.name,
                    "Worker thread panicked outside a task"
                );
            }
        }
        true
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    /// Decide admission under the lock, publish `CallPermitted`, then hand
    /// the job off. Handoff and enqueue slots are reserved so no concurrent
    /// submitter can take them in between.
    fn admit<E>(&self, job: Job) -> Result<(), ResilienceError<E>> {
        let inner = &self.inner;
        let admission = {
            let mut state = inner.state.lock();

            if state.shutdown {
                drop(state);
                inner.reject();
                return Err(ResilienceError::Aborted(format!(
                    "thread pool bulkhead '{}' is shut down",
                    inner.name
                )));
            }

            if state.idle > state.pending() {
                state.reserved += 1;
                Admission::Handoff
            } else if state.workers < inner.config.max_thread_pool_size {
                state.workers += 1;
                state.spawned += 1;
                state.handles.retain(|handle| !handle.is_finished());
                Admission::Spawn(state.spawned)
            } else if state.queue_depth() < inner.config.queue_capacity {
                state.reserved += 1;
                Admission::Enqueue
            } else {
                let queued = state.tasks.len();
                drop(state);
                tracing::warn!(
                    thread_pool_bulkhead = %inner.name,
                    queued,
                    "Thread pool bulkhead full"
                );
                inner.reject();
                return Err(ResilienceError::BulkheadFull {
                    name: inner.name.clone(),
                });
            }
        };

        inner.publish(BulkheadEventKind::CallPermitted);

        match admission {
            Admission::Spawn(id) => self.spawn_worker(id, job),
            Admission::Handoff | Admission::Enqueue => {
                {
                    let mut state = inner.state.lock();
                    state.reserved -= 1;
                    state.tasks.push_back(job);
                }
                inner.work_available.notify_one();
                Ok(())
            }
        }
    }

    fn spawn_worker<E>(&self, id: u64, first: Job) -> Result<(), ResilienceError<E>> {
        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.inner.name, id))
            .spawn(move || run_worker(inner, first));

        match spawned {
            Ok(handle) => {
                tracing::debug!(thread_pool_bulkhead = %self.inner.name, id, "Started worker");
                self.inner.state.lock().handles.push(handle);
                Ok(())
            }
            Err(e) => {
                self.inner.state.lock().workers -= 1;
                Err(ResilienceError::Aborted(format!(
                    "failed to start worker for '{}': {}",
                    self.inner.name, e
                )))
            }
        }
    }
}

fn run_worker(inner: Arc<Inner>, first: Job) {
    let mut job = Some(first);

    loop {
        if let Some(task) = job.take() {
            task();
            inner.publish(BulkheadEventKind::CallFinished);
        }

        let mut state = inner.state.lock();
        loop {
            if let Some(next) = state.tasks.pop_front() {
                job = Some(next);
                break;
            }
            if state.shutdown && state.reserved == 0 {
                state.workers -= 1;
                if state.workers == 0 {
                    inner.terminated.notify_all();
                }
                return;
            }

            state.idle += 1;
            let timed_out = inner
                .work_available
                .wait_for(&mut state, inner.config.keep_alive_duration)
                .timed_out();
            state.idle -= 1;

            if timed_out
                && state.pending() == 0
                && state.workers > inner.config.core_thread_pool_size
            {
                state.workers -= 1;
                tracing::debug!(thread_pool_bulkhead = %inner.name, "Reclaimed idle worker");
                return;
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("task panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("task panicked: {}", message)
    } else {
        "task panicked".to_string()
    }
}

impl Policy for ThreadPoolBulkhead {
    type Metrics = ThreadPoolBulkheadMetrics;
    type Event = BulkheadEvent;

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn metrics(&self) -> ThreadPoolBulkheadMetrics {
        let config = &self.inner.config;
        let (workers, depth) = {
            let state = self.inner.state.lock();
            (state.workers, state.queue_depth())
        };
        ThreadPoolBulkheadMetrics {
            core_thread_pool_size: config.core_thread_pool_size,
            thread_pool_size: workers,
            maximum_thread_pool_size: config.max_thread_pool_size,
            queue_depth: depth,
            queue_capacity: config.queue_capacity,
            remaining_queue_capacity: config.queue_capacity.saturating_sub(depth),
            rejected_calls: self.inner.rejected.load(Ordering::Relaxed),
        }
    }

    fn events(&self) -> &EventPublisher<BulkheadEvent> {
        &self.inner.events
    }
}

/// Result of work admitted to a [`ThreadPoolBulkhead`]
///
/// Await it from async code, or call [`wait`](Self::wait) from a plain
/// thread.
#[derive(Debug)]
pub struct BulkheadFuture<T, E> {
    rx: oneshot::Receiver<Result<T, ResilienceError<E>>>,
}

impl<T, E> BulkheadFuture<T, E> {
    /// Block the current thread until the task completes.
    ///
    /// Must not be called from within an async runtime.
    pub fn wait(self) -> Result<T, ResilienceError<E>> {
        self.rx.blocking_recv().unwrap_or_else(|_| Err(dropped()))
    }
}

impl<T, E> Future for BulkheadFuture<T, E> {
    type Output = Result<T, ResilienceError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(dropped())))
    }
}

fn dropped<E>() -> ResilienceError<E> {
    ResilienceError::Aborted("task dropped before completion".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::mpsc;

    type TestResult<T> = Result<T, ResilienceError<io::Error>>;

    fn pool(core: usize, max: usize, queue: usize) -> ThreadPoolBulkhead {
        ThreadPoolBulkhead::new(
            "test",
            ThreadPoolBulkheadConfig {
                core_thread_pool_size: core,
                max_thread_pool_size: max,
                queue_capacity: queue,
                keep_alive_duration: Duration::from_millis(20),
            },
        )
        .unwrap()
    }

    fn gated(gate: mpsc::Receiver<()>, value: u32) -> impl FnOnce() -> TestResult<u32> + Send {
        move || {
            let _ = gate.recv();
            Ok(value)
        }
    }

    #[test]
    fn test_core_above_max_rejected() {
        let err = ThreadPoolBulkhead::new(
            "test",
            ThreadPoolBulkheadConfig {
                core_thread_pool_size: 4,
                max_thread_pool_size: 2,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::Ordering { .. }));
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ThreadPoolBulkheadConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.core_thread_pool_size <= config.max_thread_pool_size);
    }

    #[test]
    fn test_run_queue_then_reject() {
        let pool = pool(1, 1, 1);
        let (open_first, first_gate) = mpsc::channel();
        let (open_second, second_gate) = mpsc::channel();

        let first = pool.submit(gated(first_gate, 1)).unwrap();
        let second = pool.submit(gated(second_gate, 2)).unwrap();
        assert_eq!(pool.metrics().queue_depth, 1);
        assert_eq!(pool.metrics().remaining_queue_capacity, 0);

        let third = pool.submit(|| TestResult::Ok(3));
        assert!(third.unwrap_err().is_bulkhead_full());
        assert_eq!(pool.metrics().rejected_calls, 1);

        open_first.send(()).unwrap();
        open_second.send(()).unwrap();
        assert_eq!(first.wait().unwrap(), 1);
        assert_eq!(second.wait().unwrap(), 2);

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let pool = pool(1, 1, 1);
        let panicked = pool
            .submit(|| -> TestResult<()> { panic!("kaboom") })
            .unwrap();
        match panicked.wait() {
            Err(ResilienceError::Aborted(message)) => assert!(message.contains("kaboom")),
            other => panic!("Expected Aborted, got {:?}", other),
        }

        // the same worker picks up the next task
        let next = pool.submit(|| TestResult::Ok("alive")).unwrap();
        assert_eq!(next.wait().unwrap(), "alive");
        assert_eq!(pool.metrics().thread_pool_size, 1);

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_idle_workers_above_core_are_reclaimed() {
        let pool = pool(1, 2, 0);
        let (open_a, gate_a) = mpsc::channel();
        let (open_b, gate_b) = mpsc::channel();

        let a = pool.submit(gated(gate_a, 1)).unwrap();
        let b = pool.submit(gated(gate_b, 2)).unwrap();
        assert_eq!(pool.metrics().thread_pool_size, 2);

        open_a.send(()).unwrap();
        open_b.send(()).unwrap();
        a.wait().unwrap();
        b.wait().unwrap();

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(pool.metrics().thread_pool_size, 1);

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_shutdown_drains_queue_and_rejects_new_work() {
        let pool = pool(1, 1, 4);
        let (open, gate) = mpsc::channel();
        let first = pool.submit(gated(gate, 1)).unwrap();
        let queued: Vec<_> = (2..5)
            .map(|n| pool.submit(move || TestResult::Ok(n)).unwrap())
            .collect();

        pool.shutdown();
        let late = pool.submit(|| TestResult::Ok(99));
        assert!(matches!(late, Err(ResilienceError::Aborted(_))));
        assert_eq!(pool.metrics().rejected_calls, 1);

        open.send(()).unwrap();
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(first.wait().unwrap(), 1);
        let results: Vec<u32> = queued.into_iter().map(|f| f.wait().unwrap()).collect();
        assert_eq!(results, vec![2, 3, 4]);
        assert_eq!(pool.metrics().thread_pool_size, 0);
    }

    #[test]
    fn test_permitted_always_precedes_finished() {
        let pool = pool(2, 2, 4);
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let seen = kinds.clone();
        pool.events()
            .on_event(move |e: &BulkheadEvent| seen.lock().push(e.kind));

        for n in 0..100u32 {
            assert_eq!(pool.submit(move || TestResult::Ok(n)).unwrap().wait().unwrap(), n);
        }
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));

        let kinds = kinds.lock();
        assert_eq!(kinds.len(), 200);
        let mut outstanding = 0i32;
        for kind in kinds.iter() {
            match kind {
                BulkheadEventKind::CallPermitted => outstanding += 1,
                BulkheadEventKind::CallFinished => outstanding -= 1,
                BulkheadEventKind::CallRejected => unreachable!(),
            }
            assert!(outstanding >= 0, "finished before permitted: {:?}", *kinds);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_future_is_awaitable() {
        let pool = pool(1, 2, 10);
        let call = pool.decorate(|| TestResult::Ok(std::thread::current().name().map(String::from)));

        let name = call().await.unwrap();
        assert!(name.unwrap().starts_with("test-"));

        pool.shutdown();
    }
}
