//! Invalidation bus shared by the three cache layers.
//!
//! The local store is authoritative. When it changes, it announces which
//! collection moved. The memory cache drops its copies; the proxy bucket marks
//! its copies stale and keeps them as the offline fallback.

use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
  /// Every cached read of a backend collection (e.g. "tasks").
  Collection(String),
  /// Drop everything.
  All,
}

impl Invalidation {
  pub fn collection(name: impl Into<String>) -> Self {
    Self::Collection(name.into())
  }

  /// Memory cache keys are request paths, optionally with a leading slash.
  pub fn matches_key(&self, key: &str) -> bool {
    match self {
      Self::All => true,
      Self::Collection(name) => {
        let key = key.trim_start_matches('/');
        key
          .strip_prefix(name.as_str())
          .map(|rest| rest.is_empty() || rest.starts_with(['/', '?', ':']))
          .unwrap_or(false)
      }
    }
  }

  /// Whether any segment of a URL path names this collection.
  pub fn matches_path(&self, path: &str) -> bool {
    match self {
      Self::All => true,
      Self::Collection(name) => path.split('/').any(|segment| segment == name),
    }
  }
}

/// Fan-out channel for [`Invalidation`] messages.
#[derive(Clone)]
pub struct InvalidationBus {
  tx: broadcast::Sender<Invalidation>,
}

impl InvalidationBus {
  pub fn new() -> Self {
    let (tx, _) = broadcast::channel(BUS_CAPACITY);
    Self { tx }
  }

  pub fn publish(&self, invalidation: Invalidation) {
    // No subscribers simply means nothing is cached yet
    let _ = self.tx.send(invalidation);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<Invalidation> {
    self.tx.subscribe()
  }
}

impl Default for InvalidationBus {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_matches_key() {
    let tasks = Invalidation::collection("tasks");
    assert!(tasks.matches_key("/tasks"));
    assert!(tasks.matches_key("tasks?owner_id=u1"));
    assert!(tasks.matches_key("/tasks/42"));
    assert!(!tasks.matches_key("/tasksets"));
    assert!(!tasks.matches_key("/habits"));
    assert!(Invalidation::All.matches_key("/anything"));
  }

  #[test]
  fn test_matches_path() {
    let tasks = Invalidation::collection("tasks");
    assert!(tasks.matches_path("/rest/v1/tasks"));
    assert!(tasks.matches_path("/rest/v1/tasks/42"));
    assert!(!tasks.matches_path("/rest/v1/habits"));
  }

  #[tokio::test]
  async fn test_publish_reaches_subscribers() {
    let bus = InvalidationBus::new();
    let mut rx = bus.subscribe();
    bus.publish(Invalidation::collection("tasks"));
    assert_eq!(rx.recv().await.unwrap(), Invalidation::collection("tasks"));
  }
}
