//! Tracing subscriber setup.
//!
//! Logs always go to a daily rolling file under the data directory. With
//! `--verbose` they are mirrored to stderr at debug level.
//!
//! Filter priority: `DAYBOOK_LOG`, then `RUST_LOG`, then the verbosity default.

use std::path::Path;

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_ENV: &str = "DAYBOOK_LOG";
const LOG_FILE_PREFIX: &str = "daybook.log";

/// Install the global subscriber. Keep the guard alive until exit or buffered lines are lost.
pub fn init(log_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let file_layer = fmt::layer().with_writer(writer).with_ansi(false);
  let stderr_layer = verbose.then(|| {
    fmt::layer()
      .with_writer(std::io::stderr)
      .with_target(false)
      .compact()
  });

  tracing_subscriber::registry()
    .with(build_env_filter(verbose))
    .with(file_layer)
    .with(stderr_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialise logging: {}", e))?;

  Ok(guard)
}

fn build_env_filter(verbose: bool) -> EnvFilter {
  if let Ok(directives) = std::env::var(LOG_ENV) {
    if let Ok(filter) = EnvFilter::try_new(&directives) {
      return filter;
    }
  }

  if let Ok(filter) = EnvFilter::try_from_default_env() {
    return filter;
  }

  EnvFilter::new(default_directive(verbose))
}

fn default_directive(verbose: bool) -> &'static str {
  if verbose {
    "info,daybook=debug"
  } else {
    "info"
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_directive() {
    assert_eq!(default_directive(false), "info");
    assert!(default_directive(true).contains("daybook=debug"));
    assert!(EnvFilter::try_new(default_directive(true)).is_ok());
  }
}
