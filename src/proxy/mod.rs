//! Network proxy: an intercepting layer between the client and the backend.
//!
//! Runs as its own actor with an install/activate lifecycle, a versioned
//! response bucket and a background-sync hook.

mod bucket;
mod routing;
mod worker;

use futures::future::BoxFuture;

use crate::error::Result;

pub use bucket::{CachedResponse, EvictionPolicy, ResponseCache};
pub use routing::{ApiMatcher, Route, Router};
pub use worker::{
  LifecycleState, NetworkProxy, PageEvent, ProxyCommand, ProxyHandle, ProxyReply, ProxySettings,
};

/// Work the proxy runs when a tagged background sync fires.
pub trait SyncHandler: Send + Sync {
  fn on_sync(&self, tag: &str) -> BoxFuture<'_, Result<()>>;
}
