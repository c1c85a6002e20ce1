//! Logging setup for driftsync services.

use driftsync_core::config::LogConfig;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Parse log level from config string
fn parse_log_level(level: &str) -> tracing::Level {
  match level.to_lowercase().as_str() {
    "off" | "error" => tracing::Level::ERROR,
    "warn" => tracing::Level::WARN,
    "info" => tracing::Level::INFO,
    "debug" => tracing::Level::DEBUG,
    "trace" => tracing::Level::TRACE,
    _ => tracing::Level::INFO,
  }
}

/// Initialize logging.
///
/// Without a log directory: console with colors. With one: rolling file
/// logging (no ANSI), rotation per config.
///
/// Returns the guard that must be kept alive for the duration of the program
pub fn init_logging(config: &LogConfig, log_dir: Option<&Path>) -> Option<WorkerGuard> {
  let level = parse_log_level(&config.level);

  // Allows RUST_LOG override
  let env_filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();

  let Some(log_dir) = log_dir else {
    tracing_subscriber::fmt()
      .with_env_filter(env_filter)
      .with_target(true)
      .with_ansi(true)
      .init();
    return None;
  };

  if std::fs::create_dir_all(log_dir).is_err() {
    // Fall back to console-only logging
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    return None;
  }

  let file_appender = match config.rotation.as_str() {
    "hourly" => tracing_appender::rolling::hourly(log_dir, "driftsync.log"),
    "never" => tracing_appender::rolling::never(log_dir, "driftsync.log"),
    _ => tracing_appender::rolling::daily(log_dir, "driftsync.log"),
  };

  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_target(true)
    .with_ansi(false)
    .with_writer(file_writer)
    .init();

  Some(guard)
}
