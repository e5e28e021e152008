/*!
 * Error types for Bulwark
 */

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::circuit_breaker::CircuitState;

/// Invalid or conflicting policy configuration.
///
/// Raised only while constructing a policy instance, never at call time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    /// Policy names are used in events and logs and may not be empty
    #[error("policy name must not be empty")]
    EmptyName,

    /// A count or duration that must be strictly positive was zero
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    /// A percentage threshold outside 1..=100
    #[error("{field} must be within 1..=100 (got {value})")]
    PercentageOutOfRange { field: &'static str, value: f32 },

    /// Two settings that must respect an ordering do not
    #[error("{lower} ({lower_value}) must not exceed {upper} ({upper_value})")]
    Ordering {
        lower: &'static str,
        lower_value: u64,
        upper: &'static str,
        upper_value: u64,
    },

    /// More than one mutually exclusive setting was supplied
    #[error("only one of {0} may be configured")]
    Conflict(&'static str),

    /// Settings file could not be read or parsed
    #[error("invalid settings: {0}")]
    Settings(String),
}

/// Kind of rejection produced by a policy (as opposed to the wrapped call).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyErrorKind {
    Timeout,
    RateLimitExceeded,
    CallNotPermitted,
    BulkheadFull,
    MaxRetriesExceeded,
    Aborted,
}

impl fmt::Display for PolicyErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Timeout => "timeout",
            Self::RateLimitExceeded => "rate-limit-exceeded",
            Self::CallNotPermitted => "call-not-permitted",
            Self::BulkheadFull => "bulkhead-full",
            Self::MaxRetriesExceeded => "max-retries-exceeded",
            Self::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

/// Outcome of a protected call that did not succeed.
///
/// `E` is the wrapped call's own error type; it passes through untouched in
/// [`ResilienceError::Call`]. Every other variant is raised by a policy and
/// names the instance that raised it.
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    /// The wrapped call failed on its own
    #[error(transparent)]
    Call(E),

    /// Time limiter deadline elapsed before the call completed
    #[error("time limiter '{name}' timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    /// Rate limiter could not grant a permit within its timeout
    #[error("rate limiter '{name}' does not permit further calls")]
    RateLimitExceeded { name: String },

    /// Circuit breaker rejected the call
    #[error("circuit breaker '{name}' is {state} and does not permit further calls")]
    CallNotPermitted { name: String, state: CircuitState },

    /// Bulkhead has no free capacity
    #[error("bulkhead '{name}' is full and does not permit further calls")]
    BulkheadFull { name: String },

    /// Retry gave up on an unsatisfactory result
    #[error("retry '{name}' exhausted {attempts} attempts")]
    MaxRetriesExceeded { name: String, attempts: u32 },

    /// Work running on another task or thread panicked or was cancelled
    #[error("call aborted: {0}")]
    Aborted(String),
}

impl<E> ResilienceError<E> {
    /// Lift the wrapped call's own error.
    pub fn call(error: E) -> Self {
        ResilienceError::Call(error)
    }

    /// Policy rejection kind, `None` for the wrapped call's own failure.
    pub fn kind(&self) -> Option<PolicyErrorKind> {
        match self {
            ResilienceError::Call(_) => None,
            ResilienceError::Timeout { .. } => Some(PolicyErrorKind::Timeout),
            ResilienceError::RateLimitExceeded { .. } => Some(PolicyErrorKind::RateLimitExceeded),
            ResilienceError::CallNotPermitted { .. } => Some(PolicyErrorKind::CallNotPermitted),
            ResilienceError::BulkheadFull { .. } => Some(PolicyErrorKind::BulkheadFull),
            ResilienceError::MaxRetriesExceeded { .. } => {
                Some(PolicyErrorKind::MaxRetriesExceeded)
            }
            ResilienceError::Aborted(_) => Some(PolicyErrorKind::Aborted),
        }
    }

    /// Returns the wrapped call's error, if this is one.
    pub fn into_call(self) -> Option<E> {
        match self {
            ResilienceError::Call(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_call_not_permitted(&self) -> bool {
        matches!(self, ResilienceError::CallNotPermitted { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ResilienceError::Timeout { .. })
    }

    pub fn is_bulkhead_full(&self) -> bool {
        matches!(self, ResilienceError::BulkheadFull { .. })
    }

    pub fn is_rate_limit_exceeded(&self) -> bool {
        matches!(self, ResilienceError::RateLimitExceeded { .. })
    }
}

impl<E> ResilienceError<E>
where
    E: StdError + 'static,
{
    /// The outcome-kind value classification predicates run over.
    pub fn failure(&self) -> Failure<'_> {
        match self {
            ResilienceError::Call(e) => Failure::Call(e),
            ResilienceError::Timeout { .. } => Failure::Policy(PolicyErrorKind::Timeout),
            ResilienceError::RateLimitExceeded { .. } => {
                Failure::Policy(PolicyErrorKind::RateLimitExceeded)
            }
            ResilienceError::CallNotPermitted { .. } => {
                Failure::Policy(PolicyErrorKind::CallNotPermitted)
            }
            ResilienceError::BulkheadFull { .. } => Failure::Policy(PolicyErrorKind::BulkheadFull),
            ResilienceError::MaxRetriesExceeded { .. } => {
                Failure::Policy(PolicyErrorKind::MaxRetriesExceeded)
            }
            ResilienceError::Aborted(_) => Failure::Policy(PolicyErrorKind::Aborted),
        }
    }
}

/// Borrowed view of a failed outcome, used by [`crate::classify`].
#[derive(Debug, Clone, Copy)]
pub enum Failure<'a> {
    /// A policy rejected or cut the call short
    Policy(PolicyErrorKind),
    /// The wrapped call returned its own error
    Call(&'a (dyn StdError + 'static)),
}

impl fmt::Display for Failure<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Policy(kind) => write!(f, "{}", kind),
            Failure::Call(e) => write!(f, "{}", e),
        }
    }
}
