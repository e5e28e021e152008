/*!
 * Logging and tracing initialization
 *
 * Policies only emit `tracing` events. Applications that already install
 * their own subscriber need nothing from this module; the rest can call
 * [`init_logging`] once at startup.
 */

use std::fs::File;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::ConfigurationError;

/// Install a global subscriber for the crate's diagnostics.
///
/// `RUST_LOG` takes precedence over the configured level. Fails with
/// [`ConfigurationError::Settings`] when a global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ConfigurationError> {
    let env_filter = build_filter(config)?;

    match config.log_file {
        Some(ref log_path) => init_file_logging(log_path, config.format, env_filter),
        None => init_stderr_logging(config.format, env_filter),
    }
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, ConfigurationError> {
    let level = config.level.to_tracing_level();
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("bulwark={}", level)))
        .map_err(|e| ConfigurationError::Settings(format!("Failed to create log filter: {}", e)))
}

fn already_set(e: impl std::fmt::Display) -> ConfigurationError {
    ConfigurationError::Settings(format!("Failed to install subscriber: {}", e))
}

/// Initialize logging to stderr
fn init_stderr_logging(format: LogFormat, env_filter: EnvFilter) -> Result<(), ConfigurationError> {
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match format {
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_names(true)
                    .with_span_events(FmtSpan::NONE)
                    .compact(),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_names(true)
                    .json(),
            )
            .try_init(),
    };
    installed.map_err(already_set)
}

/// Initialize logging to a file
fn init_file_logging(
    log_path: &Path,
    format: LogFormat,
    env_filter: EnvFilter,
) -> Result<(), ConfigurationError> {
    let file = File::create(log_path)
        .map_err(|e| ConfigurationError::Settings(format!("Failed to create log file: {}", e)))?;
    let writer = Mutex::new(file);
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match format {
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_target(true)
                    .with_thread_names(true)
                    .with_ansi(false)
                    .compact(),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_ansi(false) // No ANSI colors in file
                    .json(),
            )
            .try_init(),
    };
    installed.map_err(already_set)
}
