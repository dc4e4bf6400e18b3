use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderValue, ACCEPT};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use url::Url;

use crate::cache::{CacheHandle, MemoryCache, Query};
use crate::config::Config;
use crate::http::{HttpRequest, HttpResponse, HttpTransport, Transport};
use crate::invalidation::InvalidationBus;
use crate::proxy::{NetworkProxy, PageEvent, ProxyHandle, ResponseCache, SyncHandler};
use crate::store::{LocalStore, LocalTask, PendingMutation, Task};
use crate::sync::{
  BackgroundSync, Connectivity, ConnectivityMonitor, DrainReport, Drainer, SyncCoordinator,
  SyncEvent, SyncHandle,
};

/// How often `run` polls its watched query
const TICK_RATE: Duration = Duration::from_secs(1);
const SYNC_EVENT_CAPACITY: usize = 64;

/// The wired-up client: store, coordinator, proxy and memory cache.
pub struct App {
  config: Config,
  api_base: Url,
  upstream: Arc<dyn Transport>,
  connectivity: Connectivity,
  proxy: ProxyHandle,
  sync: SyncHandle,
  cache: CacheHandle<Value>,
}

impl App {
  pub async fn new(config: Config) -> Result<Self> {
    let upstream = Arc::new(HttpTransport::new(config.request_timeout())?);
    Self::with_transport(config, upstream)
  }

  /// Wire everything around an existing upstream transport.
  pub fn with_transport(config: Config, upstream: Arc<dyn Transport>) -> Result<Self> {
    let api_base = config.backend_url()?;
    let store = Arc::new(LocalStore::open(&config.store_path()?)?);
    let responses = Arc::new(ResponseCache::open(&config.response_cache_path()?)?);
    let bus = InvalidationBus::new();
    let (events, _) = tokio::sync::broadcast::channel(SYNC_EVENT_CAPACITY);

    // Queue replay always talks to the backend directly
    let drainer = Drainer::new(
      store,
      upstream.clone(),
      config.drain_policy(),
      bus.clone(),
      events.clone(),
    )
    .with_user(config.sync.user_id.clone());

    let handler: Arc<dyn SyncHandler> = Arc::new(drainer.clone());
    let proxy = NetworkProxy::spawn(
      config.proxy_settings()?,
      upstream.clone(),
      responses,
      Some(handler),
      &bus,
    );

    let connectivity = Connectivity::new(true);
    let background: Arc<dyn BackgroundSync> = Arc::new(proxy.clone());
    let sync = SyncCoordinator::spawn(
      config.sync_settings()?,
      drainer,
      Arc::new(proxy.clone()),
      connectivity.clone(),
      Some(background),
      bus.clone(),
      events,
    );

    let cache = MemoryCache::spawn();
    cache.follow(&bus);

    Ok(Self {
      config,
      api_base,
      upstream,
      connectivity,
      proxy,
      sync,
      cache,
    })
  }

  /// Cached JSON read of a backend path, through the memory cache and the proxy.
  pub async fn get(&self, path: &str, refresh: bool) -> Result<Value> {
    self.wait_for_proxy().await;

    let mut query = self.query(path)?;
    if refresh {
      query.refresh().await?;
    } else {
      query.fetch().await?;
    }
    query.settle().await;

    match (query.data(), query.error()) {
      (Some(data), _) => Ok(data.clone()),
      (None, Some(error)) => Err(eyre!("Failed to load {}: {}", path, error)),
      (None, None) => Err(eyre!("No data for {}", path)),
    }
  }

  pub async fn save_task(&self, task: &Task) -> Result<LocalTask> {
    Ok(self.sync.save_task(task).await?)
  }

  pub async fn delete_task(&self, task_id: &str) -> Result<bool> {
    Ok(self.sync.delete_task(task_id).await?)
  }

  pub fn list_tasks(&self, owner_id: &str) -> Result<Vec<LocalTask>> {
    Ok(self.sync.get_tasks(owner_id)?)
  }

  pub fn get_preferences(&self, user_id: &str) -> Result<Map<String, Value>> {
    Ok(self.sync.get_user_preferences(user_id)?)
  }

  pub fn set_preferences(
    &self,
    user_id: &str,
    patch: &Map<String, Value>,
  ) -> Result<Map<String, Value>> {
    Ok(self.sync.update_user_preferences(user_id, patch)?)
  }

  pub fn pending(&self) -> Result<Vec<PendingMutation>> {
    Ok(self.sync.pending_requests()?)
  }

  /// Drain the queue in place.
  pub async fn sync_now(&self) -> Result<DrainReport> {
    Ok(self.sync.process_all_pending_requests().await?)
  }

  /// Keep everything running until Ctrl-C, logging what happens.
  ///
  /// With `watch`, that path is re-read every tick and printed whenever it changes.
  pub async fn run(&self, watch: Option<&str>) -> Result<()> {
    let monitor = ConnectivityMonitor::spawn(
      self.connectivity.clone(),
      self.upstream.clone(),
      self.api_base.clone(),
      self.config.probe_interval(),
    );
    let mut sync_events = self.sync.subscribe();
    let mut page_events = self.proxy.subscribe();

    self.wait_for_proxy().await;
    let mut query = watch.map(|path| self.query(path)).transpose()?;
    if let Some(query) = &mut query {
      query.fetch().await?;
      print_query(query);
    }

    info!(pending = self.sync.pending_requests()?.len(), "daybook running");
    let mut ticker = tokio::time::interval(TICK_RATE);

    loop {
      tokio::select! {
        _ = tokio::signal::ctrl_c() => break,
        event = sync_events.recv() => match event {
          Ok(event) => log_sync_event(&event),
          Err(RecvError::Lagged(_)) => continue,
          Err(RecvError::Closed) => break,
        },
        event = page_events.recv() => match event {
          Ok(event) => log_page_event(&event),
          Err(RecvError::Lagged(_)) => continue,
          Err(RecvError::Closed) => break,
        },
        _ = ticker.tick() => {
          if let Some(query) = &mut query {
            if query.poll() {
              print_query(query);
            }
            if !query.is_loading() {
              query.fetch().await?;
            }
          }
        }
      }
    }

    monitor.stop();
    info!("daybook stopped");
    Ok(())
  }

  pub fn shutdown(&self) {
    self.sync.shutdown();
    self.proxy.shutdown();
    let _ = self.cache.shutdown();
  }

  fn query(&self, path: &str) -> Result<Query<Value>> {
    let url = api_url(&self.api_base, path)?;
    let transport = self.proxy.clone();

    Ok(Query::new(
      self.cache.clone(),
      path.trim_start_matches('/'),
      self.config.cache_options(),
      move || {
        let transport = transport.clone();
        let request = HttpRequest::get(url.clone())
          .with_header(ACCEPT, HeaderValue::from_static("application/json"));
        async move {
          let response = transport
            .send(request)
            .await
            .and_then(HttpResponse::error_for_status)
            .map_err(|e| e.to_string())?;
          response.json::<Value>().map_err(|e| e.to_string())
        }
      },
    ))
  }

  /// Give the proxy a chance to take control before reading through it.
  async fn wait_for_proxy(&self) {
    let wait = self.proxy.wait_until_activated();
    match tokio::time::timeout(self.config.request_timeout(), wait).await {
      Ok(Ok(())) => {}
      Ok(Err(e)) => warn!(error = %e, "proxy not available, reading straight from the network"),
      Err(_) => warn!("proxy still installing, reading straight from the network"),
    }
  }
}

/// Resolve a backend path against the API base.
fn api_url(base: &Url, path: &str) -> Result<Url> {
  let mut base = base.clone();
  if !base.path().ends_with('/') {
    base.set_path(&format!("{}/", base.path()));
  }
  base
    .join(path.trim_start_matches('/'))
    .map_err(|e| eyre!("Invalid path '{}': {}", path, e))
}

fn print_query(query: &Query<Value>) {
  if let Some(error) = query.error() {
    eprintln!("{}: {}", query.key(), error);
  }
  if let Some(data) = query.data() {
    println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
  }
}

fn log_sync_event(event: &SyncEvent) {
  match event {
    SyncEvent::ConnectivityChanged(online) => info!(online, "connectivity changed"),
    SyncEvent::Drained(report) if report.attempted() > 0 => info!(
      delivered = report.delivered,
      retrying = report.retrying,
      dropped = report.dropped,
      "sync finished"
    ),
    SyncEvent::Drained(_) => {}
    SyncEvent::MutationDropped {
      id,
      method,
      url,
      attempts,
    } => warn!(%id, %method, %url, attempts, "gave up on queued change"),
  }
}

fn log_page_event(event: &PageEvent) {
  match event {
    PageEvent::Notification { title, body, url } => info!(
      %title,
      body = body.as_deref().unwrap_or(""),
      url = url.as_deref().unwrap_or(""),
      "notification"
    ),
    PageEvent::Navigate(url) => info!(%url, "navigate"),
    PageEvent::UpdateActivated { version } => info!(%version, "proxy update activated"),
  }
}
