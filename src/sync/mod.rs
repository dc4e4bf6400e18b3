//! Offline mutation queue and the coordinator that drains it.

mod connectivity;
mod coordinator;
mod drain;

use futures::future::BoxFuture;

use crate::error::Result;

pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use coordinator::{SyncCoordinator, SyncHandle, SyncSettings};
pub use drain::{DrainPolicy, DrainReport, Drainer, Outcome, DEFAULT_MAX_ATTEMPTS};

/// Things worth telling a UI about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
  ConnectivityChanged(bool),
  /// A drain pass finished
  Drained(DrainReport),
  /// A mutation failed too many times and was discarded
  MutationDropped {
    id: String,
    method: String,
    url: String,
    attempts: u32,
  },
}

/// How a sync request was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPath {
  /// Handed to the proxy's background sync
  Background,
  /// Drained in place
  Direct(DrainReport),
}

/// Something that can run a tagged sync on our behalf later.
pub trait BackgroundSync: Send + Sync {
  fn register(&self, tag: &str) -> BoxFuture<'_, Result<()>>;
}
