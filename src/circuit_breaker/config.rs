use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classify::{ErrorClassifier, ErrorPredicate, ResultPredicate};
use crate::error::ConfigurationError;

/// How the breaker's outcome history is bounded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlidingWindowType {
    /// Last `sliding_window_size` calls
    #[default]
    CountBased,
    /// Calls of the last `sliding_window_size` seconds
    TimeBased,
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure percentage (1..=100) at or above which the circuit opens
    pub failure_rate_threshold: f32,
    /// Slow-call percentage (1..=100) at or above which the circuit opens
    pub slow_call_rate_threshold: f32,
    /// Calls taking longer than this are recorded as slow
    pub slow_call_duration_threshold: Duration,
    /// Outcomes required before rates are computed
    pub minimum_number_of_calls: u32,
    pub sliding_window_type: SlidingWindowType,
    /// Calls (count-based) or seconds (time-based)
    pub sliding_window_size: u32,
    /// Trial calls admitted while half-open
    pub permitted_calls_in_half_open: u32,
    /// Half-open trials that take longer than this force the circuit open;
    /// zero waits indefinitely
    pub max_wait_duration_in_half_open: Duration,
    /// How long the circuit stays open before trial calls are allowed
    pub wait_duration_in_open: Duration,
    /// Move to half-open on a timer instead of on the next call
    pub automatic_transition_from_open_to_half_open: bool,
    /// Errors that are neither successes nor failures
    pub ignore_errors: Vec<ErrorPredicate>,
    /// Explicit failure set; when non-empty (or `record_error` is set) other
    /// errors count as successes
    pub record_errors: Vec<ErrorPredicate>,
    pub record_error: Option<ErrorPredicate>,
    /// Successful results matching this predicate are recorded as failures
    pub record_result: Option<ResultPredicate>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            minimum_number_of_calls: 100,
            sliding_window_type: SlidingWindowType::CountBased,
            sliding_window_size: 100,
            permitted_calls_in_half_open: 10,
            max_wait_duration_in_half_open: Duration::ZERO,
            wait_duration_in_open: Duration::from_secs(60),
            automatic_transition_from_open_to_half_open: false,
            ignore_errors: Vec::new(),
            record_errors: Vec::new(),
            record_error: None,
            record_result: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        check_percentage("failure_rate_threshold", self.failure_rate_threshold)?;
        check_percentage("slow_call_rate_threshold", self.slow_call_rate_threshold)?;

        let positive = [
            (
                "slow_call_duration_threshold",
                !self.slow_call_duration_threshold.is_zero(),
            ),
            ("minimum_number_of_calls", self.minimum_number_of_calls > 0),
            ("sliding_window_size", self.sliding_window_size > 0),
            (
                "permitted_calls_in_half_open",
                self.permitted_calls_in_half_open > 0,
            ),
            ("wait_duration_in_open", !self.wait_duration_in_open.is_zero()),
        ];
        for (field, ok) in positive {
            if !ok {
                return Err(ConfigurationError::NotPositive { field });
            }
        }
        Ok(())
    }

    pub(crate) fn classifier(&self) -> ErrorClassifier {
        let classifier = self
            .ignore_errors
            .iter()
            .cloned()
            .fold(ErrorClassifier::new(), ErrorClassifier::ignore);
        self.record_errors
            .iter()
            .chain(self.record_error.iter())
            .cloned()
            .fold(classifier, ErrorClassifier::include)
    }
}

fn check_percentage(field: &'static str, value: f32) -> Result<(), ConfigurationError> {
    if (1.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigurationError::PercentageOutOfRange { field, value })
    }
}
