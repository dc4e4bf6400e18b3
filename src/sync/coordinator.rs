//! Sync actor and the handle the rest of the app talks to.
//!
//! The actor owns the triggers (connectivity, interval, explicit requests).
//! Reads and local writes go straight to the store through [`SyncHandle`].

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Interval;
use tracing::{debug, info, warn};
use url::Url;

use super::{BackgroundSync, Connectivity, DrainReport, Drainer, SyncEvent, SyncPath};
use crate::error::{DaybookError, Result};
use crate::http::{HttpRequest, HttpResponse, Transport};
use crate::invalidation::{Invalidation, InvalidationBus};
use crate::store::{
  task_mutation_id, LocalStore, LocalTask, PendingMutation, SyncStatus, Task, TaskOp,
};

/// Where tasks live on the backend and how often to sync.
#[derive(Debug, Clone)]
pub struct SyncSettings {
  /// Base URL of the backend API; tasks live under `<api_base>/tasks`
  pub api_base: Url,
  /// Tag used for background sync registration
  pub tag: String,
  /// Periodic drain while online; `None` disables it
  pub interval: Option<Duration>,
}

enum Command {
  Trigger {
    reply: oneshot::Sender<Result<SyncPath>>,
  },
  Shutdown,
}

/// Actor that decides when to drain.
pub struct SyncCoordinator {
  drainer: Drainer,
  connectivity: Connectivity,
  background: Option<Arc<dyn BackgroundSync>>,
  tag: String,
  interval: Option<Duration>,
  events: broadcast::Sender<SyncEvent>,
  online_rx: watch::Receiver<bool>,
  /// Connectivity as of the last observed change, seeded when spawned
  was_online: bool,
  rx: mpsc::UnboundedReceiver<Command>,
}

impl SyncCoordinator {
  /// Start the actor.
  ///
  /// `transport` carries direct task writes. `drainer` replays the queue and
  /// must publish onto `events`. Pass `background` to prefer handing drains
  /// to the proxy.
  pub fn spawn(
    settings: SyncSettings,
    drainer: Drainer,
    transport: Arc<dyn Transport>,
    connectivity: Connectivity,
    background: Option<Arc<dyn BackgroundSync>>,
    bus: InvalidationBus,
    events: broadcast::Sender<SyncEvent>,
  ) -> SyncHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    // Subscribing marks the current value seen, so any flip after this point wakes the actor
    let online_rx = connectivity.subscribe();
    let was_online = *online_rx.borrow();

    let coordinator = Self {
      drainer: drainer.clone(),
      connectivity: connectivity.clone(),
      background,
      tag: settings.tag,
      interval: settings.interval,
      events: events.clone(),
      online_rx,
      was_online,
      rx,
    };
    tokio::spawn(coordinator.run());

    SyncHandle {
      tx,
      store: drainer.store().clone(),
      drainer,
      transport,
      connectivity,
      bus,
      events,
      api_base: settings.api_base,
    }
  }

  async fn run(mut self) {
    let mut watching = true;
    let mut ticker = self.interval.map(|period| {
      let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      ticker
    });

    loop {
      tokio::select! {
        command = self.rx.recv() => match command {
          Some(Command::Trigger { reply }) => {
            let result = self.trigger_sync().await;
            if let Err(e) = &result {
              warn!(error = %e, "sync failed");
            }
            let _ = reply.send(result);
          }
          Some(Command::Shutdown) | None => break,
        },
        changed = self.online_rx.changed(), if watching => {
          if changed.is_err() {
            watching = false;
            continue;
          }
          let online = *self.online_rx.borrow_and_update();
          let _ = self.events.send(SyncEvent::ConnectivityChanged(online));
          // Only real flips notify, so waking up online after being online
          // means an offline spell was coalesced away
          if online {
            info!(was_online = self.was_online, "back online, syncing pending mutations");
            if let Err(e) = self.trigger_sync().await {
              warn!(error = %e, "sync after reconnect failed");
            }
          }
          self.was_online = online;
        }
        _ = next_tick(&mut ticker) => {
          if self.connectivity.is_online() {
            if let Err(e) = self.trigger_sync().await {
              warn!(error = %e, "periodic sync failed");
            }
          }
        }
      }
    }

    debug!("sync coordinator stopped");
  }

  /// Prefer background sync; drain in place when it is missing or refuses.
  async fn trigger_sync(&self) -> Result<SyncPath> {
    if let Some(background) = &self.background {
      match background.register(&self.tag).await {
        Ok(()) => return Ok(SyncPath::Background),
        Err(e) => debug!(error = %e, "background sync unavailable, draining directly"),
      }
    }

    let report = self.drainer.process_all_pending_requests().await?;
    Ok(SyncPath::Direct(report))
  }
}

async fn next_tick(ticker: &mut Option<Interval>) {
  match ticker {
    Some(ticker) => {
      ticker.tick().await;
    }
    None => std::future::pending().await,
  }
}

/// Entry point for task writes, preferences and sync requests.
#[derive(Clone)]
pub struct SyncHandle {
  tx: mpsc::UnboundedSender<Command>,
  store: Arc<LocalStore>,
  drainer: Drainer,
  transport: Arc<dyn Transport>,
  connectivity: Connectivity,
  bus: InvalidationBus,
  events: broadcast::Sender<SyncEvent>,
  api_base: Url,
}

impl SyncHandle {
  pub fn store(&self) -> &Arc<LocalStore> {
    &self.store
  }

  pub fn is_online(&self) -> bool {
    self.connectivity.is_online()
  }

  pub fn connectivity(&self) -> watch::Receiver<bool> {
    self.connectivity.subscribe()
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.events.subscribe()
  }

  // ==========================================================================
  // Tasks
  // ==========================================================================

  /// Save a task locally and get it to the backend now or later.
  ///
  /// Online with an empty queue the write goes out immediately. Otherwise, or
  /// when the network refuses, the mirror is marked pending and one mutation
  /// is queued for it.
  pub async fn save_task(&self, task: &Task) -> Result<LocalTask> {
    let body = serde_json::to_value(task)?;
    let url = self.tasks_url(None)?;
    let request = HttpRequest::new(Method::POST, url.clone()).with_json(&body)?;

    let local = if self.send_now(request).await? {
      self.store.save_task(task, SyncStatus::Synced)?
    } else {
      let local = self.store.save_task(task, SyncStatus::Pending)?;
      self.store.queue_request(
        &task_mutation_id(&task.id, TaskOp::Upsert),
        url.as_str(),
        TaskOp::Upsert.method().as_str(),
        Some(&body),
      )?;
      local
    };

    self.bus.publish(Invalidation::collection("tasks"));
    Ok(local)
  }

  /// Remove a task locally and on the backend. Returns whether it existed locally.
  pub async fn delete_task(&self, task_id: &str) -> Result<bool> {
    let url = self.tasks_url(Some(task_id))?;
    let existed = self.store.delete_task(task_id)?;

    if !self.send_now(HttpRequest::new(Method::DELETE, url.clone())).await? {
      self.store.queue_request(
        &task_mutation_id(task_id, TaskOp::Delete),
        url.as_str(),
        TaskOp::Delete.method().as_str(),
        None,
      )?;
    }

    self.bus.publish(Invalidation::collection("tasks"));
    Ok(existed)
  }

  pub fn get_tasks(&self, owner_id: &str) -> Result<Vec<LocalTask>> {
    self.store.get_tasks(owner_id)
  }

  /// Queue an arbitrary mutation for the next drain.
  pub fn queue_request(
    &self,
    id: &str,
    url: &str,
    method: &str,
    body: Option<&Value>,
  ) -> Result<PendingMutation> {
    self.store.queue_request(id, url, method, body)
  }

  pub fn pending_requests(&self) -> Result<Vec<PendingMutation>> {
    self.store.pending_requests()
  }

  // ==========================================================================
  // Preferences
  // ==========================================================================

  pub fn update_user_preferences(
    &self,
    user_id: &str,
    patch: &Map<String, Value>,
  ) -> Result<Map<String, Value>> {
    Ok(self.store.update_user_preferences(user_id, patch)?.preferences)
  }

  pub fn get_user_preferences(&self, user_id: &str) -> Result<Map<String, Value>> {
    self.store.get_user_preferences(user_id)
  }

  // ==========================================================================
  // Sync
  // ==========================================================================

  /// Ask the coordinator to sync and wait for it to pick a path.
  pub async fn trigger_sync(&self) -> Result<SyncPath> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(Command::Trigger { reply })
      .map_err(|_| DaybookError::Other("Sync coordinator stopped".to_string()))?;
    rx.await
      .map_err(|_| DaybookError::Other("Sync coordinator dropped the request".to_string()))?
  }

  /// Drain the queue here and now, bypassing background sync.
  pub async fn process_all_pending_requests(&self) -> Result<DrainReport> {
    self.drainer.process_all_pending_requests().await
  }

  pub fn shutdown(&self) {
    let _ = self.tx.send(Command::Shutdown);
  }

  /// Try a write right away. `Ok(false)` means it should be queued instead.
  async fn send_now(&self, request: HttpRequest) -> Result<bool> {
    if !self.connectivity.is_online() || self.store.pending_count()? > 0 {
      return Ok(false);
    }

    let method = request.method.clone();
    let url = request.url.clone();
    match self
      .transport
      .send(request)
      .await
      .and_then(HttpResponse::error_for_status)
    {
      Ok(_) => Ok(true),
      Err(e) if e.is_retryable() => {
        debug!(%method, %url, error = %e, "direct write failed, queueing");
        Ok(false)
      }
      Err(e) => Err(e),
    }
  }

  fn tasks_url(&self, task_id: Option<&str>) -> Result<Url> {
    let mut url = self.api_base.clone();
    {
      let mut segments = url
        .path_segments_mut()
        .map_err(|_| DaybookError::Other(format!("Cannot build task URL from {}", self.api_base)))?;
      segments.pop_if_empty().push("tasks");
      if let Some(id) = task_id {
        segments.push(id);
      }
    }
    Ok(url)
  }
}
