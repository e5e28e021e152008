/*!
 * Settings file support
 *
 * Policies are configured in code through their typed config structs. This
 * module adds a TOML file format with one named section per policy instance,
 * e.g. `[circuit_breaker.inventory]`, so deployments can tune thresholds
 * without recompiling. Every field is optional and falls back to the typed
 * config's default. Durations are given in milliseconds.
 *
 * Predicates and interval functions cannot be expressed in a file; attach
 * them to the converted config before constructing the policy.
 */

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bulkhead::BulkheadConfig;
use crate::circuit_breaker::{CircuitBreakerConfig, SlidingWindowType};
use crate::error::ConfigurationError;
use crate::rate_limiter::RateLimiterConfig;
use crate::retry::{IntervalFunction, RetryConfig};
use crate::thread_pool_bulkhead::ThreadPoolBulkheadConfig;
use crate::time_limiter::TimeLimiterConfig;

/// Contents of a settings file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    pub logging: LoggingConfig,
    pub time_limiter: BTreeMap<String, TimeLimiterSettings>,
    pub rate_limiter: BTreeMap<String, RateLimiterSettings>,
    pub retry: BTreeMap<String, RetrySettings>,
    pub circuit_breaker: BTreeMap<String, CircuitBreakerSettings>,
    pub bulkhead: BTreeMap<String, BulkheadSettings>,
    pub thread_pool_bulkhead: BTreeMap<String, ThreadPoolBulkheadSettings>,
}

impl ResilienceSettings {
    /// Load settings from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::Settings(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigurationError> {
        toml::from_str(contents).map_err(|e| ConfigurationError::Settings(e.to_string()))
    }

    /// Save settings to a TOML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigurationError> {
        let path = path.as_ref();
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigurationError::Settings(e.to_string()))?;
        std::fs::write(path, contents).map_err(|e| {
            ConfigurationError::Settings(format!("failed to write {}: {}", path.display(), e))
        })
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Settings for [`crate::logging::init_logging`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Log file path (None = stderr)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

fn millis(value: Option<u64>, fallback: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(fallback)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeLimiterSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_on_timeout: Option<bool>,
}

impl TimeLimiterSettings {
    pub fn to_config(&self) -> TimeLimiterConfig {
        let defaults = TimeLimiterConfig::default();
        TimeLimiterConfig {
            timeout_duration: millis(self.timeout_duration_ms, defaults.timeout_duration),
            cancel_on_timeout: self.cancel_on_timeout.unwrap_or(defaults.cancel_on_timeout),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_for_period: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_refresh_period_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_duration_ms: Option<u64>,
}

impl RateLimiterSettings {
    pub fn to_config(&self) -> RateLimiterConfig {
        let defaults = RateLimiterConfig::default();
        RateLimiterConfig {
            limit_for_period: self.limit_for_period.unwrap_or(defaults.limit_for_period),
            limit_refresh_period: millis(
                self.limit_refresh_period_ms,
                defaults.limit_refresh_period,
            ),
            timeout_duration: millis(self.timeout_duration_ms, defaults.timeout_duration),
        }
    }
}

/// Retry section
///
/// `wait_duration_ms` alone gives a fixed wait. Adding `backoff_multiplier`
/// (optionally capped by `max_wait_duration_ms`) makes it exponential;
/// adding `randomization_factor` makes it randomized. The two are exclusive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_wait_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub randomization_factor: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_after_max_attempts: Option<bool>,
}

impl RetrySettings {
    pub fn to_config(&self) -> Result<RetryConfig, ConfigurationError> {
        let defaults = RetryConfig::default();
        let wait = millis(self.wait_duration_ms, crate::retry::DEFAULT_WAIT_DURATION);

        let (wait_duration, interval_function) =
            match (self.backoff_multiplier, self.randomization_factor) {
                (Some(_), Some(_)) => {
                    return Err(ConfigurationError::Conflict(
                        "backoff_multiplier and randomization_factor",
                    ))
                }
                (Some(multiplier), None) => {
                    let function = match self.max_wait_duration_ms {
                        Some(max) => IntervalFunction::exponential_capped(
                            wait,
                            multiplier,
                            Duration::from_millis(max),
                        ),
                        None => IntervalFunction::exponential(wait, multiplier),
                    };
                    (None, Some(function))
                }
                (None, Some(factor)) => (None, Some(IntervalFunction::randomized(wait, factor))),
                (None, None) => (self.wait_duration_ms.map(Duration::from_millis), None),
            };

        Ok(RetryConfig {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            wait_duration,
            interval_function,
            fail_after_max_attempts: self
                .fail_after_max_attempts
                .unwrap_or(defaults.fail_after_max_attempts),
            ..defaults
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_rate_threshold: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slow_call_rate_threshold: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slow_call_duration_threshold_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_number_of_calls: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sliding_window_type: Option<SlidingWindowType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sliding_window_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permitted_calls_in_half_open: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_wait_duration_in_half_open_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_duration_in_open_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automatic_transition_from_open_to_half_open: Option<bool>,
}

impl CircuitBreakerSettings {
    pub fn to_config(&self) -> CircuitBreakerConfig {
        let d = CircuitBreakerConfig::default();
        CircuitBreakerConfig {
            failure_rate_threshold: self
                .failure_rate_threshold
                .unwrap_or(d.failure_rate_threshold),
            slow_call_rate_threshold: self
                .slow_call_rate_threshold
                .unwrap_or(d.slow_call_rate_threshold),
            slow_call_duration_threshold: millis(
                self.slow_call_duration_threshold_ms,
                d.slow_call_duration_threshold,
            ),
            minimum_number_of_calls: self
                .minimum_number_of_calls
                .unwrap_or(d.minimum_number_of_calls),
            sliding_window_type: self.sliding_window_type.unwrap_or(d.sliding_window_type),
            sliding_window_size: self.sliding_window_size.unwrap_or(d.sliding_window_size),
            permitted_calls_in_half_open: self
                .permitted_calls_in_half_open
                .unwrap_or(d.permitted_calls_in_half_open),
            max_wait_duration_in_half_open: millis(
                self.max_wait_duration_in_half_open_ms,
                d.max_wait_duration_in_half_open,
            ),
            wait_duration_in_open: millis(self.wait_duration_in_open_ms, d.wait_duration_in_open),
            automatic_transition_from_open_to_half_open: self
                .automatic_transition_from_open_to_half_open
                .unwrap_or(d.automatic_transition_from_open_to_half_open),
            ..d
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_calls: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_wait_duration_ms: Option<u64>,
}

impl BulkheadSettings {
    pub fn to_config(&self) -> BulkheadConfig {
        let defaults = BulkheadConfig::default();
        BulkheadConfig {
            max_concurrent_calls: self
                .max_concurrent_calls
                .unwrap_or(defaults.max_concurrent_calls),
            max_wait_duration: millis(self.max_wait_duration_ms, defaults.max_wait_duration),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolBulkheadSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_thread_pool_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core_thread_pool_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive_duration_ms: Option<u64>,
}

impl ThreadPoolBulkheadSettings {
    pub fn to_config(&self) -> ThreadPoolBulkheadConfig {
        let defaults = ThreadPoolBulkheadConfig::default();
        let max = self
            .max_thread_pool_size
            .unwrap_or(defaults.max_thread_pool_size);
        ThreadPoolBulkheadConfig {
            max_thread_pool_size: max,
            // keep the default core size consistent with an overridden max
            core_thread_pool_size: self
                .core_thread_pool_size
                .unwrap_or_else(|| defaults.core_thread_pool_size.min(max)),
            queue_capacity: self.queue_capacity.unwrap_or(defaults.queue_capacity),
            keep_alive_duration: millis(self.keep_alive_duration_ms, defaults.keep_alive_duration),
        }
    }
}
