//! Cache entries and freshness options.

use std::time::Duration;

use tokio::time::Instant;

/// Default time-to-live for cached reads: 5 minutes.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Options governing freshness for a cached read.
#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
  /// How long a value stays fresh after it was stored
  pub ttl: Duration,
  /// Serve stale data immediately while refetching in the background
  pub stale_while_revalidate: bool,
  /// Join an already running fetch for the same key instead of starting another
  pub dedupe_in_flight: bool,
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self {
      ttl: DEFAULT_TTL,
      stale_while_revalidate: true,
      dedupe_in_flight: true,
    }
  }
}

impl CacheOptions {
  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  pub fn with_stale_while_revalidate(mut self, enabled: bool) -> Self {
    self.stale_while_revalidate = enabled;
    self
  }

  pub fn with_dedupe(mut self, enabled: bool) -> Self {
    self.dedupe_in_flight = enabled;
    self
  }
}

/// A cached value. Replaced wholesale on refresh, never mutated.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
  pub key: String,
  pub data: T,
  pub timestamp: Instant,
  pub expires_at: Instant,
}

impl<T> CacheEntry<T> {
  pub fn new(key: impl Into<String>, data: T, ttl: Duration) -> Self {
    let timestamp = Instant::now();
    Self {
      key: key.into(),
      data,
      timestamp,
      expires_at: timestamp + ttl,
    }
  }

  pub fn is_fresh(&self) -> bool {
    Instant::now() < self.expires_at
  }
}

/// Outcome of looking a key up without fetching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
  Fresh(T),
  Stale(T),
  Missing,
}

impl<T> Lookup<T> {
  pub fn data(self) -> Option<T> {
    match self {
      Lookup::Fresh(data) | Lookup::Stale(data) => Some(data),
      Lookup::Missing => None,
    }
  }
}
