// Error types for the daybook sync layer.
// Network, server, persistence and retry failures, matching how callers react to each.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaybookError {
  /// Request was rejected before a response arrived (connect failure, timeout, offline).
  #[error("network error: {0}")]
  Network(String),

  /// A response arrived but was not 2xx.
  #[error("server responded with {status}")]
  Server { status: u16 },

  /// Local transactional store failure. Never retried in-process.
  #[error("local store error: {0}")]
  Persistence(#[from] rusqlite::Error),

  /// A queued mutation was dropped after hitting the retry cap.
  #[error("mutation {id} dropped after {attempts} attempts")]
  RetryExhausted { id: String, attempts: u32 },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// The proxy task has shut down or never started.
  #[error("network proxy unavailable")]
  ProxyUnavailable,

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("{0}")]
  Other(String),
}

impl DaybookError {
  /// Whether this failure should count against a queued mutation's retry budget.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Self::Network(_) | Self::Server { .. })
  }

  pub(crate) fn lock_poisoned(what: &str) -> Self {
    Self::Other(format!("{} lock poisoned", what))
  }
}

pub type Result<T> = std::result::Result<T, DaybookError>;
