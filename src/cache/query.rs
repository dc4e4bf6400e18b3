//! Consumer-facing cached read.
//!
//! Inspired by TanStack Query, a `Query<T>` binds a cache key to a fetcher and
//! tracks what the consumer should display: data, a loading flag and the last
//! error. Dropping the query is "unmounting": fetches still complete and still
//! update the shared cache, but their results no longer reach this consumer.
//!
//! # Example
//!
//! ```ignore
//! let client = transport.clone();
//! let mut query = Query::new(cache.clone(), "/tasks", CacheOptions::default(), move || {
//!     let client = client.clone();
//!     async move { client.list_tasks().await.map_err(|e| e.to_string()) }
//! });
//!
//! query.fetch().await?;
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//! ```

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::warn;

use super::actor::{CacheHandle, Ticket};
use super::entry::{CacheOptions, Lookup};
use crate::error::Result;

/// A boxed future that returns a Result<T, String>
type BoxFuture<T> = Pin<Box<dyn Future<Output = std::result::Result<T, String>> + Send>>;

/// A factory function that creates futures for fetching data
type FetcherFn<T> = Box<dyn Fn() -> BoxFuture<T> + Send + Sync>;

/// Cached read with stale-while-revalidate semantics.
pub struct Query<T> {
  key: String,
  options: CacheOptions,
  cache: CacheHandle<T>,
  fetcher: FetcherFn<T>,
  data: Option<T>,
  is_loading: bool,
  error: Option<String>,
  receiver: Option<mpsc::UnboundedReceiver<std::result::Result<T, String>>>,
}

impl<T: Clone + Send + 'static> Query<T> {
  /// Create a new query for `key`.
  ///
  /// The fetcher is called each time the cache decides the network is needed.
  pub fn new<F, Fut>(
    cache: CacheHandle<T>,
    key: impl Into<String>,
    options: CacheOptions,
    fetcher: F,
  ) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, String>> + Send + 'static,
  {
    Self {
      key: key.into(),
      options,
      cache,
      fetcher: Box::new(move || Box::pin(fetcher())),
      data: None,
      is_loading: false,
      error: None,
      receiver: None,
    }
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn data(&self) -> Option<&T> {
    self.data.as_ref()
  }

  pub fn is_loading(&self) -> bool {
    self.is_loading
  }

  pub fn error(&self) -> Option<&str> {
    self.error.as_deref()
  }

  /// Read through the cache.
  ///
  /// 1. Fresh entry: serve it, no network call
  /// 2. Stale entry with stale-while-revalidate: serve it, refetch in the background
  /// 3. Stale without stale-while-revalidate, or missing: fetch and report loading
  pub async fn fetch(&mut self) -> Result<()> {
    match self.cache.lookup(&self.key).await? {
      Lookup::Fresh(data) => {
        self.data = Some(data);
        self.is_loading = false;
        self.error = None;
        Ok(())
      }
      Lookup::Stale(data) if self.options.stale_while_revalidate => {
        self.data = Some(data);
        self.start_fetch(false, false).await
      }
      Lookup::Stale(_) | Lookup::Missing => self.start_fetch(false, true).await,
    }
  }

  /// Fetch unconditionally, ignoring freshness and any fetch already running.
  pub async fn refresh(&mut self) -> Result<()> {
    self.start_fetch(true, true).await
  }

  /// Drop this key from the shared cache.
  pub fn invalidate(&self) -> Result<()> {
    self.cache.invalidate(&self.key)
  }

  /// Poll for results from a pending fetch.
  ///
  /// Returns `true` if the state changed (data arrived or error occurred).
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    match receiver.try_recv() {
      Ok(result) => {
        self.apply(result);
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        self.apply(Err("Query was cancelled".to_string()));
        true
      }
    }
  }

  /// Wait for the pending fetch, if any, and apply its result.
  pub async fn settle(&mut self) {
    let Some(receiver) = &mut self.receiver else {
      return;
    };
    let result = receiver
      .recv()
      .await
      .unwrap_or_else(|| Err("Query was cancelled".to_string()));
    self.apply(result);
  }

  fn apply(&mut self, result: std::result::Result<T, String>) {
    match result {
      Ok(data) => {
        self.data = Some(data);
        self.error = None;
      }
      // stale data stays visible next to the error
      Err(error) => self.error = Some(error),
    }
    self.is_loading = false;
    self.receiver = None;
  }

  async fn start_fetch(&mut self, force: bool, show_loading: bool) -> Result<()> {
    let ticket = self
      .cache
      .begin(&self.key, force, self.options.dedupe_in_flight)
      .await?;

    // Replacing the receiver discards whatever an older fetch would have delivered
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    if show_loading {
      self.is_loading = true;
    }

    match ticket {
      Ticket::Leader { generation } => {
        let future = (self.fetcher)();
        let cache = self.cache.clone();
        let key = self.key.clone();
        let ttl = self.options.ttl;
        tokio::spawn(async move {
          // A panicking fetcher still has to release the in-flight slot
          let result = match AssertUnwindSafe(future).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
              let message = panic_message(panic.as_ref());
              warn!(key = %key, error = %message, "fetcher panicked");
              Err(format!("Fetch panicked: {}", message))
            }
          };
          // Ignore send errors - the cache or the consumer may be gone
          let _ = cache.complete(&key, generation, ttl, result.clone());
          let _ = tx.send(result);
        });
      }
      Ticket::Follower(waiter) => {
        tokio::spawn(async move {
          let result = waiter
            .await
            .unwrap_or_else(|_| Err("Shared fetch was abandoned".to_string()));
          let _ = tx.send(result);
        });
      }
    }

    Ok(())
  }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
  if let Some(message) = panic.downcast_ref::<&str>() {
    message.to_string()
  } else if let Some(message) = panic.downcast_ref::<String>() {
    message.clone()
  } else {
    "unknown panic".to_string()
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("data", &self.data)
      .field("is_loading", &self.is_loading)
      .field("error", &self.error)
      .finish_non_exhaustive()
  }
}
