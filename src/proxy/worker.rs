//! The proxy actor and its handle.
//!
//! Lifecycle: `Parsed -> Installing -> Installed -> Activating -> Activated`,
//! or `Redundant` when install fails. Until it is activated the proxy does not
//! control anything and every fetch goes straight upstream.

use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use url::Url;

use super::bucket::{EvictionPolicy, ResponseCache};
use super::routing::{ApiMatcher, Router};
use super::SyncHandler;
use crate::error::{DaybookError, Result};
use crate::http::{HttpRequest, HttpResponse, Transport};
use crate::invalidation::{Invalidation, InvalidationBus};
use crate::sync::BackgroundSync;

const DEFAULT_NOTIFICATION_TITLE: &str = "Daybook";
const PAGE_EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Parsed,
  Installing,
  Installed,
  Activating,
  Activated,
  Redundant,
}

#[derive(Debug, Clone)]
pub struct ProxySettings {
  pub version: String,
  pub cache_prefix: String,
  /// Base that relative precache entries resolve against
  pub origin: Url,
  /// Static assets fetched at install time
  pub precache: Vec<String>,
  /// Activate as soon as install finishes instead of waiting for `SkipWaiting`
  pub skip_waiting: bool,
  pub sync_tag: String,
  pub api: ApiMatcher,
  pub eviction: EvictionPolicy,
}

impl ProxySettings {
  /// Name of the bucket this version owns.
  pub fn bucket_name(&self) -> String {
    format!("{}-{}", self.cache_prefix, self.version)
  }
}

/// Messages a page can post to the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyCommand {
  /// Apply a waiting update now
  SkipWaiting,
  GetVersion,
  /// Empty the current bucket
  ClearCache,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyReply {
  Ack,
  Version(String),
  Cleared(usize),
}

/// Things the proxy tells pages about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEvent {
  Notification {
    title: String,
    body: Option<String>,
    url: Option<String>,
  },
  Navigate(String),
  UpdateActivated {
    version: String,
  },
}

#[derive(Debug, Default, Deserialize)]
struct PushPayload {
  title: Option<String>,
  body: Option<String>,
  url: Option<String>,
}

fn notification_from_push(payload: &[u8]) -> PageEvent {
  let parsed = serde_json::from_slice::<PushPayload>(payload).unwrap_or_else(|_| {
    let text = String::from_utf8_lossy(payload).trim().to_string();
    PushPayload {
      body: (!text.is_empty()).then_some(text),
      ..Default::default()
    }
  });

  PageEvent::Notification {
    title: parsed
      .title
      .unwrap_or_else(|| DEFAULT_NOTIFICATION_TITLE.to_string()),
    body: parsed.body,
    url: parsed.url,
  }
}

enum Message {
  Fetch {
    request: HttpRequest,
    reply: oneshot::Sender<Result<HttpResponse>>,
  },
  Command {
    command: ProxyCommand,
    reply: oneshot::Sender<Result<ProxyReply>>,
  },
  RegisterSync {
    tag: String,
    reply: oneshot::Sender<Result<()>>,
  },
  Push(Vec<u8>),
  NotificationClick(String),
  Shutdown,
}

/// The proxy actor.
pub struct NetworkProxy {
  settings: ProxySettings,
  bucket: String,
  upstream: Arc<dyn Transport>,
  cache: Arc<ResponseCache>,
  router: Router,
  sync_handler: Option<Arc<dyn SyncHandler>>,
  state: watch::Sender<LifecycleState>,
  events: broadcast::Sender<PageEvent>,
  invalidations: broadcast::Receiver<Invalidation>,
  /// `SkipWaiting` arrived before install finished
  skip_requested: bool,
  rx: mpsc::UnboundedReceiver<Message>,
}

impl NetworkProxy {
  /// Start the proxy. It installs and, with `skip_waiting`, activates on its own.
  pub fn spawn(
    settings: ProxySettings,
    upstream: Arc<dyn Transport>,
    cache: Arc<ResponseCache>,
    sync_handler: Option<Arc<dyn SyncHandler>>,
    bus: &InvalidationBus,
  ) -> ProxyHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (state, state_rx) = watch::channel(LifecycleState::Parsed);
    let (events, _) = broadcast::channel(PAGE_EVENT_CAPACITY);
    let router = Router::new(
      upstream.clone(),
      cache.clone(),
      settings.api.clone(),
      settings.eviction,
    );

    let proxy = Self {
      bucket: settings.bucket_name(),
      settings,
      upstream: upstream.clone(),
      cache,
      router,
      sync_handler,
      state,
      events: events.clone(),
      invalidations: bus.subscribe(),
      skip_requested: false,
      rx,
    };
    tokio::spawn(proxy.run());

    ProxyHandle {
      tx,
      upstream,
      state: state_rx,
      events,
    }
  }

  async fn run(mut self) {
    self.set_state(LifecycleState::Installing);
    let (done, installed) = oneshot::channel();
    let job = InstallJob {
      upstream: self.upstream.clone(),
      cache: self.cache.clone(),
      settings: self.settings.clone(),
      bucket: self.bucket.clone(),
    };
    tokio::spawn(async move {
      let _ = done.send(job.run().await);
    });

    let mut install = Some(installed);
    let mut watching = true;
    loop {
      tokio::select! {
        result = wait_install(&mut install) => {
          install = None;
          self.finish_install(result);
        }
        message = self.rx.recv() => match message {
          Some(Message::Shutdown) | None => break,
          Some(message) => self.handle(message),
        },
        invalidation = self.invalidations.recv(), if watching => match invalidation {
          Ok(invalidation) => self.mark_stale(&invalidation),
          Err(RecvError::Lagged(skipped)) => {
            debug!(skipped, "missed invalidations, marking whole bucket stale");
            self.mark_stale(&Invalidation::All);
          }
          Err(RecvError::Closed) => watching = false,
        },
      }
    }

    debug!(version = %self.settings.version, "proxy stopped");
  }

  fn state(&self) -> LifecycleState {
    *self.state.borrow()
  }

  fn set_state(&self, state: LifecycleState) {
    debug!(?state, version = %self.settings.version, "proxy lifecycle");
    self.state.send_replace(state);
  }

  fn finish_install(&mut self, result: Result<usize>) {
    match result {
      Ok(count) => {
        info!(version = %self.settings.version, count, "proxy installed");
        self.set_state(LifecycleState::Installed);
        if self.settings.skip_waiting || self.skip_requested {
          self.activate();
        }
      }
      Err(e) => {
        warn!(version = %self.settings.version, error = %e, "proxy install failed");
        self.set_state(LifecycleState::Redundant);
      }
    }
  }

  /// Sweep every other bucket, then take control.
  fn activate(&mut self) {
    self.set_state(LifecycleState::Activating);

    match self.cache.bucket_names() {
      Ok(names) => {
        for name in names.iter().filter(|name| **name != self.bucket) {
          match self.cache.delete_bucket(name) {
            Ok(_) => info!(bucket = %name, "deleted stale response bucket"),
            Err(e) => warn!(bucket = %name, error = %e, "failed to delete stale bucket"),
          }
        }
      }
      Err(e) => warn!(error = %e, "failed to list response buckets"),
    }

    self.set_state(LifecycleState::Activated);
    let _ = self.events.send(PageEvent::UpdateActivated {
      version: self.settings.version.clone(),
    });
    info!(version = %self.settings.version, "proxy activated");
  }

  fn handle(&mut self, message: Message) {
    match message {
      Message::Fetch { request, reply } => {
        if self.state() == LifecycleState::Activated {
          let router = self.router.clone();
          let bucket = self.bucket.clone();
          tokio::spawn(async move {
            let _ = reply.send(router.handle(&bucket, request).await);
          });
        } else {
          let upstream = self.upstream.clone();
          tokio::spawn(async move {
            let _ = reply.send(upstream.send(request).await);
          });
        }
      }
      Message::Command { command, reply } => {
        let _ = reply.send(self.on_command(command));
      }
      Message::RegisterSync { tag, reply } => {
        let _ = reply.send(self.on_sync(tag));
      }
      Message::Push(payload) => {
        let _ = self.events.send(notification_from_push(&payload));
      }
      Message::NotificationClick(url) => {
        let _ = self.events.send(PageEvent::Navigate(url));
      }
      // handled by the run loop
      Message::Shutdown => {}
    }
  }

  fn on_command(&mut self, command: ProxyCommand) -> Result<ProxyReply> {
    match command {
      ProxyCommand::SkipWaiting => match self.state() {
        LifecycleState::Installed => {
          self.activate();
          Ok(ProxyReply::Ack)
        }
        LifecycleState::Parsed | LifecycleState::Installing => {
          self.skip_requested = true;
          Ok(ProxyReply::Ack)
        }
        LifecycleState::Redundant => Err(DaybookError::ProxyUnavailable),
        LifecycleState::Activating | LifecycleState::Activated => Ok(ProxyReply::Ack),
      },
      ProxyCommand::GetVersion => Ok(ProxyReply::Version(self.settings.version.clone())),
      ProxyCommand::ClearCache => {
        let cleared = self.cache.delete_matching(&self.bucket, &Invalidation::All)?;
        Ok(ProxyReply::Cleared(cleared))
      }
    }
  }

  fn on_sync(&self, tag: String) -> Result<()> {
    let Some(handler) = self.sync_handler.clone() else {
      return Err(DaybookError::ProxyUnavailable);
    };
    if self.state() != LifecycleState::Activated {
      return Err(DaybookError::ProxyUnavailable);
    }
    if tag != self.settings.sync_tag {
      return Err(DaybookError::Other(format!("Unknown sync tag '{}'", tag)));
    }

    tokio::spawn(async move {
      if let Err(e) = handler.on_sync(&tag).await {
        warn!(tag = %tag, error = %e, "background sync failed");
      }
    });
    Ok(())
  }

  /// Stale entries stay as the offline fallback until refreshed.
  fn mark_stale(&self, invalidation: &Invalidation) {
    match self.cache.mark_stale(&self.bucket, invalidation) {
      Ok(0) => {}
      Ok(marked) => debug!(?invalidation, marked, "marked cached responses stale"),
      Err(e) => warn!(error = %e, "failed to mark cached responses stale"),
    }
  }
}

/// Precache work, run off the actor so fetches keep flowing during install.
struct InstallJob {
  upstream: Arc<dyn Transport>,
  cache: Arc<ResponseCache>,
  settings: ProxySettings,
  bucket: String,
}

impl InstallJob {
  /// Fetch the whole manifest, then write it. Nothing is written unless every entry succeeded.
  async fn run(self) -> Result<usize> {
    let mut fetched = Vec::with_capacity(self.settings.precache.len());
    for entry in &self.settings.precache {
      let url = self.settings.origin.join(entry).map_err(|e| {
        DaybookError::Other(format!("Invalid precache entry '{}': {}", entry, e))
      })?;
      let request = HttpRequest::get(url);
      let response = self.upstream.send(request.clone()).await?;
      if response.status != StatusCode::OK {
        return Err(DaybookError::Server {
          status: response.status.as_u16(),
        });
      }
      fetched.push((request, response));
    }

    self.cache.open_bucket(&self.bucket)?;
    for (request, response) in &fetched {
      if let Err(e) = self
        .cache
        .put(&self.bucket, request, response, &self.settings.eviction)
      {
        self.cache.delete_bucket(&self.bucket)?;
        return Err(e);
      }
    }
    Ok(fetched.len())
  }
}

async fn wait_install(install: &mut Option<oneshot::Receiver<Result<usize>>>) -> Result<usize> {
  match install {
    Some(rx) => rx
      .await
      .unwrap_or_else(|_| Err(DaybookError::Other("Install task stopped".to_string()))),
    None => std::future::pending().await,
  }
}

/// Page-side handle to a running proxy.
///
/// Also a [`Transport`]: requests sent through it are intercepted by the
/// proxy. If the proxy is gone they go straight upstream.
#[derive(Clone)]
pub struct ProxyHandle {
  tx: mpsc::UnboundedSender<Message>,
  upstream: Arc<dyn Transport>,
  state: watch::Receiver<LifecycleState>,
  events: broadcast::Sender<PageEvent>,
}

impl ProxyHandle {
  pub fn state(&self) -> LifecycleState {
    *self.state.borrow()
  }

  pub fn state_changes(&self) -> watch::Receiver<LifecycleState> {
    self.state.clone()
  }

  /// Wait for activation. Fails if install failed or the proxy stopped.
  pub async fn wait_until_activated(&self) -> Result<()> {
    let mut rx = self.state.clone();
    loop {
      let state = *rx.borrow_and_update();
      match state {
        LifecycleState::Activated => return Ok(()),
        LifecycleState::Redundant => return Err(DaybookError::ProxyUnavailable),
        _ => {}
      }
      rx.changed()
        .await
        .map_err(|_| DaybookError::ProxyUnavailable)?;
    }
  }

  /// Request/response messaging with the proxy.
  pub async fn post_message(&self, command: ProxyCommand) -> Result<ProxyReply> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(Message::Command { command, reply })
      .map_err(|_| DaybookError::ProxyUnavailable)?;
    rx.await.map_err(|_| DaybookError::ProxyUnavailable)?
  }

  /// Deliver a push message; the proxy turns it into a notification.
  pub fn push(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
    self
      .tx
      .send(Message::Push(payload.into()))
      .map_err(|_| DaybookError::ProxyUnavailable)
  }

  pub fn notification_click(&self, url: impl Into<String>) -> Result<()> {
    self
      .tx
      .send(Message::NotificationClick(url.into()))
      .map_err(|_| DaybookError::ProxyUnavailable)
  }

  pub fn subscribe(&self) -> broadcast::Receiver<PageEvent> {
    self.events.subscribe()
  }

  pub fn shutdown(&self) {
    let _ = self.tx.send(Message::Shutdown);
  }
}

impl Transport for ProxyHandle {
  fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
    Box::pin(async move {
      let (reply, rx) = oneshot::channel();
      match self.tx.send(Message::Fetch { request, reply }) {
        Ok(()) => rx.await.map_err(|_| DaybookError::ProxyUnavailable)?,
        Err(mpsc::error::SendError(Message::Fetch { request, .. })) => {
          self.upstream.send(request).await
        }
        Err(_) => Err(DaybookError::ProxyUnavailable),
      }
    })
  }
}

impl BackgroundSync for ProxyHandle {
  fn register(&self, tag: &str) -> BoxFuture<'_, Result<()>> {
    let tag = tag.to_string();
    Box::pin(async move {
      let (reply, rx) = oneshot::channel();
      self
        .tx
        .send(Message::RegisterSync { tag, reply })
        .map_err(|_| DaybookError::ProxyUnavailable)?;
      rx.await.map_err(|_| DaybookError::ProxyUnavailable)?
    })
  }
}
