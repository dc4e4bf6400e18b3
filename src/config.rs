use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::CacheOptions;
use crate::proxy::{ApiMatcher, EvictionPolicy, ProxySettings};
use crate::sync::{DrainPolicy, SyncSettings, DEFAULT_MAX_ATTEMPTS};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub backend: BackendConfig,
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  pub proxy: ProxyConfig,
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
  /// Base URL of the backend API, e.g. https://api.example.com/api
  pub url: Option<String>,
  /// URL prefix that marks API calls (defaults to `url`)
  pub api_pattern: Option<String>,
  pub timeout_secs: u64,
}

impl Default for BackendConfig {
  fn default() -> Self {
    Self {
      url: None,
      api_pattern: None,
      timeout_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub ttl_secs: u64,
  pub stale_while_revalidate: bool,
  pub dedupe_in_flight: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    let options = CacheOptions::default();
    Self {
      ttl_secs: options.ttl.as_secs(),
      stale_while_revalidate: options.stale_while_revalidate,
      dedupe_in_flight: options.dedupe_in_flight,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub max_attempts: u32,
  pub backoff_base_ms: u64,
  pub backoff_max_secs: u64,
  /// Periodic drain while online; 0 disables it
  pub interval_secs: u64,
  /// How often `run` probes the backend for connectivity
  pub probe_interval_secs: u64,
  pub tag: String,
  /// Session user whose sync metadata is kept current
  pub user_id: Option<String>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    let policy = DrainPolicy::default();
    Self {
      max_attempts: DEFAULT_MAX_ATTEMPTS,
      backoff_base_ms: policy.backoff_base.as_millis() as u64,
      backoff_max_secs: policy.backoff_max.as_secs(),
      interval_secs: 300,
      probe_interval_secs: 15,
      tag: "daybook-sync".to_string(),
      user_id: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
  pub version: String,
  pub cache_prefix: String,
  /// Where static assets are served from (defaults to the backend's origin)
  pub origin: Option<String>,
  pub precache: Vec<String>,
  pub skip_waiting: bool,
  pub max_entries: Option<usize>,
  pub max_age_secs: Option<u64>,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      version: "v1".to_string(),
      cache_prefix: "daybook".to_string(),
      origin: None,
      precache: vec!["/".to_string()],
      skip_waiting: true,
      max_entries: Some(500),
      max_age_secs: None,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Defaults to $XDG_DATA_HOME/daybook
  pub data_dir: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./daybook.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/daybook/config.yaml
  ///
  /// Without any file every setting takes its default.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("daybook.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("daybook").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  /// Replace the backend URL, e.g. from `--backend`.
  pub fn with_backend(mut self, url: Option<String>) -> Self {
    if url.is_some() {
      self.backend.url = url;
    }
    self
  }

  pub fn backend_url(&self) -> Result<Url> {
    let raw = self.backend.url.as_deref().ok_or_else(|| {
      eyre!(
        "No backend URL configured. Set backend.url in ~/.config/daybook/config.yaml \
         or pass --backend."
      )
    })?;
    Url::parse(raw).map_err(|e| eyre!("Invalid backend URL '{}': {}", raw, e))
  }

  pub fn api_matcher(&self) -> Result<ApiMatcher> {
    match &self.backend.api_pattern {
      Some(pattern) => {
        let url =
          Url::parse(pattern).map_err(|e| eyre!("Invalid api_pattern '{}': {}", pattern, e))?;
        Ok(ApiMatcher::from_base(&url))
      }
      None => Ok(ApiMatcher::from_base(&self.backend_url()?)),
    }
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.backend.timeout_secs)
  }

  pub fn cache_options(&self) -> CacheOptions {
    CacheOptions::default()
      .with_ttl(Duration::from_secs(self.cache.ttl_secs))
      .with_stale_while_revalidate(self.cache.stale_while_revalidate)
      .with_dedupe(self.cache.dedupe_in_flight)
  }

  pub fn drain_policy(&self) -> DrainPolicy {
    DrainPolicy {
      max_attempts: self.sync.max_attempts,
      backoff_base: Duration::from_millis(self.sync.backoff_base_ms),
      backoff_max: Duration::from_secs(self.sync.backoff_max_secs),
    }
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.sync.probe_interval_secs.max(1))
  }

  pub fn sync_settings(&self) -> Result<SyncSettings> {
    Ok(SyncSettings {
      api_base: self.backend_url()?,
      tag: self.sync.tag.clone(),
      interval: (self.sync.interval_secs > 0).then(|| Duration::from_secs(self.sync.interval_secs)),
    })
  }

  pub fn proxy_settings(&self) -> Result<ProxySettings> {
    let origin = match &self.proxy.origin {
      Some(raw) => Url::parse(raw).map_err(|e| eyre!("Invalid proxy origin '{}': {}", raw, e))?,
      None => {
        let mut origin = self.backend_url()?;
        origin.set_path("/");
        origin.set_query(None);
        origin
      }
    };

    Ok(ProxySettings {
      version: self.proxy.version.clone(),
      cache_prefix: self.proxy.cache_prefix.clone(),
      origin,
      precache: self.proxy.precache.clone(),
      skip_waiting: self.proxy.skip_waiting,
      sync_tag: self.sync.tag.clone(),
      api: self.api_matcher()?,
      eviction: EvictionPolicy {
        max_entries: self.proxy.max_entries,
        max_age: self.proxy.max_age_secs.map(Duration::from_secs),
      },
    })
  }

  /// Directory holding the databases and logs.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.storage.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("daybook"))
  }

  pub fn store_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("daybook.db"))
  }

  pub fn response_cache_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("responses.db"))
  }

  pub fn log_dir(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("logs"))
  }
}
