// src/utils/logging.rs
//! Logging utilities for the application.
//!
//! This module provides functions for initializing and configuring
//! the logging system.

use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Build the filter, letting `RUST_LOG` override the configured level
fn build_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
}

/// Initialize the logging system with console output only
pub fn init_logging(log_level: &str) -> io::Result<()> {
    let console_layer = fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_writer(io::stdout)
        .with_filter(build_filter(log_level));

    tracing_subscriber::registry()
        .with(console_layer)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("Failed to initialize logging: {}", e)))
}

/// Initialize console logging plus a daily rolling log file.
///
/// The returned guard flushes the non-blocking file writer when dropped and
/// must be held for as long as logging is wanted.
pub fn init_file_logging(log_level: &str, log_file: &str) -> io::Result<WorkerGuard> {
    let log_path = Path::new(log_file);
    let log_dir = log_path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let prefix = log_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| std::ffi::OsString::from("gateway.log"));

    let (file_writer, guard) = tracing_appender::non_blocking(rolling::daily(log_dir, prefix));

    let file_layer = fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(build_filter(log_level));

    let console_layer = fmt::layer()
        .with_writer(io::stdout)
        .with_filter(build_filter(log_level));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("Failed to set global default subscriber: {}", e),
            )
        })?;

    Ok(guard)
}

/// Log a security event with structured fields
pub fn log_security_event(event_type: &str, details: &str) {
    tracing::warn!(
        security_event.type = event_type,
        security_event.details = details,
        "Security event: [{}] {}",
        event_type,
        details
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice_reports_error() {
        // The first call may race with other tests installing a subscriber.
        let _ = init_logging("debug");
        assert!(init_logging("debug").is_err());
    }

    #[test]
    fn test_log_security_event_does_not_panic() {
        log_security_event("AUTH_REJECTED", "client 'mallory' unknown");
    }
}
