//! Draining the pending-mutation queue against the network.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use super::SyncEvent;
use crate::error::{DaybookError, Result};
use crate::http::{HttpResponse, Transport};
use crate::invalidation::{Invalidation, InvalidationBus};
use crate::proxy::SyncHandler;
use crate::store::{parse_task_mutation_id, LocalStore, PendingMutation, SyncStatus, TaskOp};

/// A record is dropped once it would exceed this many failed attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Retry limits for queued mutations.
#[derive(Debug, Clone, Copy)]
pub struct DrainPolicy {
  pub max_attempts: u32,
  /// Delay before the first retry; doubles after each further failure
  pub backoff_base: Duration,
  pub backoff_max: Duration,
}

impl Default for DrainPolicy {
  fn default() -> Self {
    Self {
      max_attempts: DEFAULT_MAX_ATTEMPTS,
      backoff_base: Duration::from_secs(2),
      backoff_max: Duration::from_secs(5 * 60),
    }
  }
}

/// What happened to one queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  /// Delivered and removed from the queue
  Delivered,
  /// Failed, kept for a later pass
  Retrying { attempts: u32 },
  /// Failed past the cap and removed for good
  Dropped { attempts: u32 },
}

/// Totals for one pass over the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub delivered: usize,
  pub retrying: usize,
  pub dropped: usize,
  /// Still backing off, not attempted this pass
  pub deferred: usize,
}

impl DrainReport {
  pub fn attempted(&self) -> usize {
    self.delivered + self.retrying + self.dropped
  }
}

/// Replays queued mutations in enqueue order.
///
/// Cloning shares the queue lock, so the coordinator and the proxy's sync
/// event never drain at the same time.
#[derive(Clone)]
pub struct Drainer {
  store: Arc<LocalStore>,
  transport: Arc<dyn Transport>,
  policy: DrainPolicy,
  bus: InvalidationBus,
  events: broadcast::Sender<SyncEvent>,
  user_id: Option<String>,
  lock: Arc<Mutex<()>>,
}

impl Drainer {
  pub fn new(
    store: Arc<LocalStore>,
    transport: Arc<dyn Transport>,
    policy: DrainPolicy,
    bus: InvalidationBus,
    events: broadcast::Sender<SyncEvent>,
  ) -> Self {
    Self {
      store,
      transport,
      policy,
      bus,
      events,
      user_id: None,
      lock: Arc::new(Mutex::new(())),
    }
  }

  /// User whose `last_sync_timestamp` is bumped after a successful pass.
  pub fn with_user(mut self, user_id: Option<String>) -> Self {
    self.user_id = user_id;
    self
  }

  pub fn store(&self) -> &Arc<LocalStore> {
    &self.store
  }

  /// Attempt the call one record describes and settle the record.
  ///
  /// Network and server failures are outcomes, not errors. Only local store
  /// failures are returned as `Err`.
  pub async fn process_pending_request(&self, record: &PendingMutation) -> Result<Outcome> {
    let result = match record.to_request() {
      Ok(request) => self
        .transport
        .send(request)
        .await
        .and_then(HttpResponse::error_for_status),
      Err(e) => Err(e),
    };

    match result {
      Ok(_) => {
        let resolved = self.store.resolve_pending(record)?;
        if let Some((task_id, op)) = parse_task_mutation_id(&record.id) {
          // A newer local write re-queued the task; it stays pending
          if resolved && op == TaskOp::Upsert {
            self.store.set_task_status(task_id, SyncStatus::Synced)?;
          }
          self.bus.publish(Invalidation::collection("tasks"));
        }
        debug!(id = %record.id, "delivered queued mutation");
        Ok(Outcome::Delivered)
      }
      Err(error) => {
        let attempts = record.attempts + 1;
        if attempts > self.policy.max_attempts {
          self.store.resolve_pending(record)?;
          let exhausted = DaybookError::RetryExhausted {
            id: record.id.clone(),
            attempts,
          };
          warn!(method = %record.method, url = %record.url, last_error = %error, "{}", exhausted);
          let _ = self.events.send(SyncEvent::MutationDropped {
            id: record.id.clone(),
            method: record.method.clone(),
            url: record.url.clone(),
            attempts,
          });
          Ok(Outcome::Dropped { attempts })
        } else {
          self
            .store
            .record_failed_attempt(record, attempts, crate::store::now())?;
          debug!(id = %record.id, attempts, %error, "queued mutation failed, will retry");
          Ok(Outcome::Retrying { attempts })
        }
      }
    }
  }

  /// One pass over the whole queue, oldest first, one request at a time.
  pub async fn process_all_pending_requests(&self) -> Result<DrainReport> {
    let _guard = self.lock.lock().await;

    let mut pending = self.store.pending_requests()?;
    pending.sort_by_key(|m| m.timestamp);

    let now = crate::store::now();
    let mut report = DrainReport::default();
    for record in &pending {
      if record.attempts > 0
        && record.next_attempt_at(self.policy.backoff_base, self.policy.backoff_max) > now
      {
        report.deferred += 1;
        continue;
      }

      match self.process_pending_request(record).await? {
        Outcome::Delivered => report.delivered += 1,
        Outcome::Retrying { .. } => report.retrying += 1,
        Outcome::Dropped { .. } => report.dropped += 1,
      }
    }

    if report.delivered > 0 {
      if let Some(user_id) = &self.user_id {
        self.store.touch_last_sync(user_id)?;
      }
    }

    if report.attempted() > 0 {
      info!(
        delivered = report.delivered,
        retrying = report.retrying,
        dropped = report.dropped,
        deferred = report.deferred,
        "drained pending mutations"
      );
    }
    let _ = self.events.send(SyncEvent::Drained(report));

    Ok(report)
  }
}

impl SyncHandler for Drainer {
  fn on_sync(&self, tag: &str) -> BoxFuture<'_, Result<()>> {
    debug!(tag, "background sync fired");
    Box::pin(async move { self.process_all_pending_requests().await.map(|_| ()) })
  }
}
