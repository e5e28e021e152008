//! Shape shared by every policy: a name, a metrics snapshot and an event
//! publisher. Decoration itself is an inherent method on each policy because
//! the thread-pool bulkhead accepts synchronous work while the others wrap
//! futures.

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use serde::Serialize;

use crate::error::ResilienceError;
use crate::event::{EventPublisher, PolicyEvent};

/// Future returned by a decorated call.
pub type CallFuture<T, E> = BoxFuture<'static, Result<T, ResilienceError<E>>>;

/// Read-only view of a policy's counters.
///
/// Snapshots are safe to take concurrently with live traffic. Values that
/// are explicitly approximate (waiting callers, queue depth) may be stale by
/// the time they are read.
pub trait MetricsSnapshot: Serialize {
    /// Named counters, e.g. `"failure_rate" -> 25.0`
    fn counters(&self) -> BTreeMap<&'static str, f64>;

    fn to_json(&self) -> serde_json::Value
    where
        Self: Sized,
    {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

pub trait Policy {
    type Metrics: MetricsSnapshot;
    type Event: PolicyEvent;

    fn name(&self) -> &str;

    fn metrics(&self) -> Self::Metrics;

    fn events(&self) -> &EventPublisher<Self::Event>;
}
