use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use crate::http::{HttpRequest, Transport};

/// Shared online/offline flag.
#[derive(Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Returns true when the flag actually flipped.
  pub fn set_online(&self, online: bool) -> bool {
    self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    })
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

/// Probes the backend on a fixed tick and feeds the result into [`Connectivity`].
///
/// Any HTTP answer counts as online; only transport failures count as offline.
pub struct ConnectivityMonitor {
  handle: JoinHandle<()>,
}

impl ConnectivityMonitor {
  pub fn spawn(
    connectivity: Connectivity,
    transport: Arc<dyn Transport>,
    probe_url: Url,
    interval: Duration,
  ) -> Self {
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

      loop {
        ticker.tick().await;

        let probe = HttpRequest::new(Method::HEAD, probe_url.clone());
        let online = match transport.send(probe).await {
          Ok(_) => true,
          Err(e) => {
            debug!(error = %e, "connectivity probe failed");
            false
          }
        };

        if connectivity.set_online(online) {
          info!(online, "connectivity changed");
        }
      }
    });

    Self { handle }
  }

  pub fn stop(&self) {
    self.handle.abort();
  }
}

impl Drop for ConnectivityMonitor {
  fn drop(&mut self) {
    self.handle.abort();
  }
}
