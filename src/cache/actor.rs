//! Cache actor that owns every entry for the session.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::entry::{CacheEntry, Lookup};
use crate::error::{DaybookError, Result};
use crate::invalidation::{Invalidation, InvalidationBus};

/// Outcome delivered to everyone waiting on a fetch.
type FetchResult<T> = std::result::Result<T, String>;

/// Permission to fetch a key, handed out by [`CacheHandle::begin`].
#[derive(Debug)]
pub enum Ticket<T> {
  /// Run the fetch and report back with [`CacheHandle::complete`] under this generation.
  Leader { generation: u64 },
  /// Another fetch for the key is already running; await its result.
  Follower(oneshot::Receiver<FetchResult<T>>),
}

enum Command<T> {
  Lookup {
    key: String,
    reply: oneshot::Sender<Lookup<T>>,
  },
  Begin {
    key: String,
    force: bool,
    dedupe: bool,
    reply: oneshot::Sender<Ticket<T>>,
  },
  Complete {
    key: String,
    generation: u64,
    ttl: Duration,
    result: FetchResult<T>,
  },
  Set {
    key: String,
    data: T,
    ttl: Duration,
  },
  Invalidate {
    key: String,
  },
  InvalidateMatching(Invalidation),
  Clear,
  Shutdown,
}

/// Issued vs. committed generations for one key.
#[derive(Debug, Default, Clone, Copy)]
struct Generations {
  issued: u64,
  committed: u64,
}

struct InFlight<T> {
  generation: u64,
  waiters: Vec<oneshot::Sender<FetchResult<T>>>,
}

/// In-memory, per-key cache. Only reachable through a [`CacheHandle`].
pub struct MemoryCache<T> {
  entries: HashMap<String, CacheEntry<T>>,
  generations: HashMap<String, Generations>,
  in_flight: HashMap<String, InFlight<T>>,
  rx: mpsc::UnboundedReceiver<Command<T>>,
}

impl<T: Clone + Send + 'static> MemoryCache<T> {
  /// Start the actor on the current runtime.
  ///
  /// It stops on [`CacheHandle::shutdown`] or once every handle is dropped.
  pub fn spawn() -> CacheHandle<T> {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = Self {
      entries: HashMap::new(),
      generations: HashMap::new(),
      in_flight: HashMap::new(),
      rx,
    };
    tokio::spawn(actor.run());
    CacheHandle { tx }
  }

  async fn run(mut self) {
    while let Some(command) = self.rx.recv().await {
      if !self.handle(command) {
        break;
      }
    }
    debug!(entries = self.entries.len(), "memory cache stopped");
  }

  /// Apply one command. Returns false when the actor should stop.
  fn handle(&mut self, command: Command<T>) -> bool {
    match command {
      Command::Lookup { key, reply } => {
        let lookup = match self.entries.get(&key) {
          Some(entry) if entry.is_fresh() => Lookup::Fresh(entry.data.clone()),
          Some(entry) => Lookup::Stale(entry.data.clone()),
          None => Lookup::Missing,
        };
        let _ = reply.send(lookup);
      }
      Command::Begin {
        key,
        force,
        dedupe,
        reply,
      } => {
        let ticket = self.begin(key, force, dedupe);
        let _ = reply.send(ticket);
      }
      Command::Complete {
        key,
        generation,
        ttl,
        result,
      } => self.complete(key, generation, ttl, result),
      Command::Set { key, data, ttl } => {
        let generations = self.generations.entry(key.clone()).or_default();
        generations.issued += 1;
        generations.committed = generations.issued;
        self.entries.insert(key.clone(), CacheEntry::new(key, data, ttl));
      }
      Command::Invalidate { key } => self.invalidate(&key),
      Command::InvalidateMatching(invalidation) => {
        let mut keys: Vec<String> = self
          .entries
          .keys()
          .chain(self.in_flight.keys())
          .filter(|k| invalidation.matches_key(k))
          .cloned()
          .collect();
        keys.sort_unstable();
        keys.dedup();
        debug!(?invalidation, dropped = keys.len(), "invalidating cached reads");
        for key in keys {
          self.invalidate(&key);
        }
      }
      Command::Clear => {
        let keys: Vec<String> = self.entries.keys().cloned().collect();
        for key in keys {
          self.invalidate(&key);
        }
      }
      Command::Shutdown => return false,
    }
    true
  }

  fn begin(&mut self, key: String, force: bool, dedupe: bool) -> Ticket<T> {
    if !force && dedupe {
      if let Some(in_flight) = self.in_flight.get_mut(&key) {
        let (tx, rx) = oneshot::channel();
        in_flight.waiters.push(tx);
        return Ticket::Follower(rx);
      }
    }

    let generations = self.generations.entry(key.clone()).or_default();
    generations.issued += 1;
    let generation = generations.issued;

    // A forced fetch takes over anyone still waiting on the older one
    let waiters = self
      .in_flight
      .remove(&key)
      .map(|f| f.waiters)
      .unwrap_or_default();
    self.in_flight.insert(
      key,
      InFlight {
        generation,
        waiters,
      },
    );

    Ticket::Leader { generation }
  }

  fn complete(&mut self, key: String, generation: u64, ttl: Duration, result: FetchResult<T>) {
    if let Ok(data) = &result {
      let generations = self.generations.entry(key.clone()).or_default();
      if generation > generations.committed {
        generations.committed = generation;
        self
          .entries
          .insert(key.clone(), CacheEntry::new(key.clone(), data.clone(), ttl));
      } else {
        debug!(%key, generation, committed = generations.committed, "dropping late response");
      }
    }

    let finished = self
      .in_flight
      .get(&key)
      .is_some_and(|f| f.generation == generation);
    if finished {
      if let Some(in_flight) = self.in_flight.remove(&key) {
        for waiter in in_flight.waiters {
          let _ = waiter.send(result.clone());
        }
      }
    }
  }

  /// Remove the entry and fence off any fetch issued before now.
  fn invalidate(&mut self, key: &str) {
    self.entries.remove(key);
    if let Some(generations) = self.generations.get_mut(key) {
      generations.committed = generations.issued;
    }
  }
}

/// Cloneable handle to a running [`MemoryCache`].
pub struct CacheHandle<T> {
  tx: mpsc::UnboundedSender<Command<T>>,
}

impl<T> Clone for CacheHandle<T> {
  fn clone(&self) -> Self {
    Self {
      tx: self.tx.clone(),
    }
  }
}

impl<T: Clone + Send + 'static> CacheHandle<T> {
  fn send(&self, command: Command<T>) -> Result<()> {
    self
      .tx
      .send(command)
      .map_err(|_| DaybookError::Other("memory cache has shut down".to_string()))
  }

  async fn request<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> Command<T>) -> Result<R> {
    let (tx, rx) = oneshot::channel();
    self.send(build(tx))?;
    rx.await
      .map_err(|_| DaybookError::Other("memory cache has shut down".to_string()))
  }

  /// Look a key up without fetching.
  pub async fn lookup(&self, key: &str) -> Result<Lookup<T>> {
    let key = key.to_string();
    self.request(|reply| Command::Lookup { key, reply }).await
  }

  /// Ask to fetch a key. See [`Ticket`].
  pub async fn begin(&self, key: &str, force: bool, dedupe: bool) -> Result<Ticket<T>> {
    let key = key.to_string();
    self
      .request(|reply| Command::Begin {
        key,
        force,
        dedupe,
        reply,
      })
      .await
  }

  /// Report the outcome of a fetch started with [`CacheHandle::begin`].
  ///
  /// Successful data is stored only if no newer generation has been committed.
  /// Failures leave the existing entry untouched.
  pub fn complete(
    &self,
    key: &str,
    generation: u64,
    ttl: Duration,
    result: FetchResult<T>,
  ) -> Result<()> {
    self.send(Command::Complete {
      key: key.to_string(),
      generation,
      ttl,
      result,
    })
  }

  /// Store a value directly.
  pub fn set(&self, key: &str, data: T, ttl: Duration) -> Result<()> {
    self.send(Command::Set {
      key: key.to_string(),
      data,
      ttl,
    })
  }

  pub fn invalidate(&self, key: &str) -> Result<()> {
    self.send(Command::Invalidate {
      key: key.to_string(),
    })
  }

  pub fn invalidate_matching(&self, invalidation: Invalidation) -> Result<()> {
    self.send(Command::InvalidateMatching(invalidation))
  }

  pub fn clear(&self) -> Result<()> {
    self.send(Command::Clear)
  }

  pub fn shutdown(&self) -> Result<()> {
    self.send(Command::Shutdown)
  }

  /// Drop matching entries whenever the bus announces a change.
  pub fn follow(&self, bus: &InvalidationBus) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    let handle = self.clone();
    tokio::spawn(async move {
      loop {
        match rx.recv().await {
          Ok(invalidation) => {
            if handle.invalidate_matching(invalidation).is_err() {
              break;
            }
          }
          Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
            debug!(skipped, "invalidation bus lagged, clearing memory cache");
            if handle.clear().is_err() {
              break;
            }
          }
          Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const TTL: Duration = Duration::from_secs(60);

  async fn leader(handle: &CacheHandle<i32>, key: &str, force: bool) -> u64 {
    match handle.begin(key, force, true).await.unwrap() {
      Ticket::Leader { generation } => generation,
      Ticket::Follower(_) => panic!("expected to lead the fetch"),
    }
  }

  #[tokio::test]
  async fn test_set_then_lookup() {
    let cache = MemoryCache::spawn();
    assert_eq!(cache.lookup("a").await.unwrap(), Lookup::Missing);

    cache.set("a", 1, TTL).unwrap();
    assert_eq!(cache.lookup("a").await.unwrap(), Lookup::Fresh(1));
  }

  #[tokio::test(start_paused = true)]
  async fn test_lookup_reports_stale() {
    let cache = MemoryCache::spawn();
    cache.set("a", 1, TTL).unwrap();
    assert_eq!(cache.lookup("a").await.unwrap(), Lookup::Fresh(1));
    tokio::time::advance(TTL).await;
    assert_eq!(cache.lookup("a").await.unwrap(), Lookup::Stale(1));
  }

  #[tokio::test]
  async fn test_late_generation_is_dropped() {
    let cache = MemoryCache::spawn();
    let old = leader(&cache, "a", false).await;
    let new = leader(&cache, "a", true).await;
    assert!(new > old);

    cache.complete("a", new, TTL, Ok(2)).unwrap();
    cache.complete("a", old, TTL, Ok(1)).unwrap();

    assert_eq!(cache.lookup("a").await.unwrap(), Lookup::Fresh(2));
  }

  #[tokio::test]
  async fn test_failure_keeps_previous_entry() {
    let cache = MemoryCache::spawn();
    cache.set("a", 1, TTL).unwrap();
    let generation = leader(&cache, "a", true).await;
    cache
      .complete("a", generation, TTL, Err("boom".to_string()))
      .unwrap();
    assert_eq!(cache.lookup("a").await.unwrap(), Lookup::Fresh(1));
  }

  #[tokio::test]
  async fn test_followers_receive_leader_result() {
    let cache = MemoryCache::spawn();
    let generation = leader(&cache, "a", false).await;
    let follower = match cache.begin("a", false, true).await.unwrap() {
      Ticket::Follower(rx) => rx,
      Ticket::Leader { .. } => panic!("expected to join the running fetch"),
    };

    cache.complete("a", generation, TTL, Ok(7)).unwrap();
    assert_eq!(follower.await.unwrap(), Ok(7));
  }

  #[tokio::test]
  async fn test_without_dedupe_everyone_leads() {
    let cache: CacheHandle<i32> = MemoryCache::spawn();
    let first = cache.begin("a", false, false).await.unwrap();
    let second = cache.begin("a", false, false).await.unwrap();
    assert!(matches!(first, Ticket::Leader { generation: 1 }));
    assert!(matches!(second, Ticket::Leader { generation: 2 }));
  }

  #[tokio::test]
  async fn test_invalidate_fences_in_flight_fetch() {
    let cache = MemoryCache::spawn();
    let generation = leader(&cache, "a", false).await;
    cache.invalidate("a").unwrap();
    cache.complete("a", generation, TTL, Ok(1)).unwrap();
    assert_eq!(cache.lookup("a").await.unwrap(), Lookup::Missing);
  }

  #[tokio::test]
  async fn test_follow_bus_drops_matching_keys() {
    let cache = MemoryCache::spawn();
    let bus = InvalidationBus::new();
    let _follower = cache.follow(&bus);

    cache.set("/tasks?owner_id=u1", 1, TTL).unwrap();
    cache.set("/habits", 2, TTL).unwrap();
    bus.publish(Invalidation::collection("tasks"));

    // Give the forwarding task a chance to run
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(
      cache.lookup("/tasks?owner_id=u1").await.unwrap(),
      Lookup::Missing
    );
    assert_eq!(cache.lookup("/habits").await.unwrap(), Lookup::Fresh(2));
  }

  #[tokio::test]
  async fn test_shutdown_stops_actor() {
    let cache: CacheHandle<i32> = MemoryCache::spawn();
    cache.shutdown().unwrap();
    assert!(cache.lookup("a").await.is_err());
  }
}
