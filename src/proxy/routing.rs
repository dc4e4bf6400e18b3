//! Fetch routing: cache-first for static assets, network-first for the API.

use std::sync::Arc;

use reqwest::{Method, StatusCode};
use tracing::{debug, warn};
use url::Url;

use super::bucket::{CachedResponse, EvictionPolicy, ResponseCache};
use crate::error::Result;
use crate::http::{HttpRequest, HttpResponse, Transport};

/// Recognises backend calls by host and path prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiMatcher {
  host: String,
  port: Option<u16>,
  path_prefix: String,
}

impl ApiMatcher {
  pub fn new(host: impl Into<String>, path_prefix: impl Into<String>) -> Self {
    Self {
      host: host.into().to_ascii_lowercase(),
      port: None,
      path_prefix: path_prefix.into(),
    }
  }

  /// Everything under `base` counts as the API.
  pub fn from_base(base: &Url) -> Self {
    Self {
      host: base.host_str().unwrap_or_default().to_ascii_lowercase(),
      port: base.port_or_known_default(),
      path_prefix: base.path().trim_end_matches('/').to_string(),
    }
  }

  pub fn matches(&self, url: &Url) -> bool {
    let host_matches = url
      .host_str()
      .is_some_and(|host| host.eq_ignore_ascii_case(&self.host));
    let port_matches = self.port.is_none() || self.port == url.port_or_known_default();
    let path = url.path();
    let path_matches = self.path_prefix.is_empty()
      || path
        .strip_prefix(self.path_prefix.as_str())
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'));

    host_matches && port_matches && path_matches
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Backend call, network-first
  Api,
  /// Static asset GET, cache-first
  Static,
  /// Not ours to cache
  PassThrough,
}

/// Routes intercepted requests and keeps the current bucket filled.
#[derive(Clone)]
pub struct Router {
  upstream: Arc<dyn Transport>,
  cache: Arc<ResponseCache>,
  api: ApiMatcher,
  policy: EvictionPolicy,
}

impl Router {
  pub fn new(
    upstream: Arc<dyn Transport>,
    cache: Arc<ResponseCache>,
    api: ApiMatcher,
    policy: EvictionPolicy,
  ) -> Self {
    Self {
      upstream,
      cache,
      api,
      policy,
    }
  }

  pub fn classify(&self, request: &HttpRequest) -> Route {
    if self.api.matches(&request.url) {
      Route::Api
    } else if request.method == Method::GET {
      Route::Static
    } else {
      Route::PassThrough
    }
  }

  pub async fn handle(&self, bucket: &str, request: HttpRequest) -> Result<HttpResponse> {
    match self.classify(&request) {
      Route::Api => Ok(self.network_first(bucket, request).await),
      Route::Static => self.cache_first(bucket, request).await,
      Route::PassThrough => self.upstream.send(request).await,
    }
  }

  /// Serve from the bucket when possible; store fresh `200`s.
  ///
  /// A stale entry is refetched, and served only if the network fails.
  pub async fn cache_first(&self, bucket: &str, request: HttpRequest) -> Result<HttpResponse> {
    let stale = match self.lookup(bucket, &request) {
      Some(CachedResponse {
        response,
        stale: false,
      }) => {
        debug!(url = %request.url, "served from cache");
        return Ok(response);
      }
      Some(hit) => Some(hit.response),
      None => None,
    };

    match self.upstream.send(request.clone()).await {
      Ok(response) => {
        if response.status == StatusCode::OK {
          self.store(bucket, &request, &response);
        }
        Ok(response)
      }
      Err(e) => match stale {
        Some(response) => {
          debug!(url = %request.url, error = %e, "network unavailable, serving stale copy");
          Ok(response)
        }
        None => Err(e),
      },
    }
  }

  /// Go to the network first; fall back to the bucket, then to a synthetic 503.
  ///
  /// Never fails: being offline is an answer, not an error.
  pub async fn network_first(&self, bucket: &str, request: HttpRequest) -> HttpResponse {
    match self.upstream.send(request.clone()).await {
      Ok(response) => {
        if request.method == Method::GET && response.is_ok() {
          self.store(bucket, &request, &response);
        }
        response
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "network unavailable, trying cache");
        // stale or not, the last good response beats the offline error
        self
          .lookup(bucket, &request)
          .map(|hit| hit.response)
          .unwrap_or_else(|| HttpResponse::offline(request.accepts_json()))
      }
    }
  }

  fn lookup(&self, bucket: &str, request: &HttpRequest) -> Option<CachedResponse> {
    match self.cache.match_request(bucket, request, &self.policy) {
      Ok(hit) => hit,
      Err(e) => {
        warn!(url = %request.url, error = %e, "response cache read failed");
        None
      }
    }
  }

  fn store(&self, bucket: &str, request: &HttpRequest, response: &HttpResponse) {
    if let Err(e) = self.cache.put(bucket, request, response, &self.policy) {
      warn!(url = %request.url, error = %e, "response cache write failed");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::DaybookError;
  use crate::http::testing::MockTransport;
  use crate::invalidation::Invalidation;
  use reqwest::header::{HeaderValue, ACCEPT};
  use serde_json::Value;

  const BUCKET: &str = "daybook-v1";

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  fn router(transport: Arc<MockTransport>) -> Router {
    router_with_cache(transport, Arc::new(ResponseCache::open_in_memory().unwrap()))
  }

  fn router_with_cache(transport: Arc<MockTransport>, cache: Arc<ResponseCache>) -> Router {
    Router::new(
      transport,
      cache,
      ApiMatcher::from_base(&url("https://api.example.com/api")),
      EvictionPolicy::default(),
    )
  }

  #[test]
  fn test_api_matcher() {
    let api = ApiMatcher::from_base(&url("https://api.example.com/api/"));
    assert!(api.matches(&url("https://api.example.com/api")));
    assert!(api.matches(&url("https://API.example.com/api/tasks?owner=1")));
    assert!(!api.matches(&url("https://api.example.com/apidocs")));
    assert!(!api.matches(&url("https://api.example.com:8443/api/tasks")));
    assert!(!api.matches(&url("https://app.example.com/api/tasks")));

    let any_path = ApiMatcher::new("api.example.com", "");
    assert!(any_path.matches(&url("http://api.example.com:8080/whatever")));
  }

  #[test]
  fn test_classify() {
    let r = router(Arc::new(MockTransport::ok()));
    let post = HttpRequest::new(Method::POST, url("https://app.example.com/form"));
    let delete = HttpRequest::new(Method::DELETE, url("https://api.example.com/api/tasks/1"));
    let api = HttpRequest::get(url("https://api.example.com/api/tasks"));
    let asset = HttpRequest::get(url("https://app.example.com/app.js"));

    assert_eq!(r.classify(&api), Route::Api);
    assert_eq!(r.classify(&delete), Route::Api);
    assert_eq!(r.classify(&asset), Route::Static);
    assert_eq!(r.classify(&post), Route::PassThrough);
  }

  #[tokio::test]
  async fn test_static_get_is_served_from_cache_the_second_time() {
    let transport = Arc::new(MockTransport::ok());
    let r = router(transport.clone());
    let request = HttpRequest::get(url("https://app.example.com/app.js"));

    r.handle(BUCKET, request.clone()).await.unwrap();
    assert_eq!(transport.call_count(), 1);

    let second = r.handle(BUCKET, request).await.unwrap();
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(transport.call_count(), 1);
  }

  #[tokio::test]
  async fn test_static_non_200_is_not_stored() {
    let transport = Arc::new(MockTransport::new(|_| Ok(HttpResponse::new(StatusCode::NOT_FOUND))));
    let r = router(transport.clone());
    let request = HttpRequest::get(url("https://app.example.com/missing.png"));

    r.handle(BUCKET, request.clone()).await.unwrap();
    r.handle(BUCKET, request).await.unwrap();
    assert_eq!(transport.call_count(), 2);
  }

  #[tokio::test]
  async fn test_api_get_offline_without_cache_returns_json_503() {
    let r = router(Arc::new(MockTransport::offline()));
    let request = HttpRequest::get(url("https://api.example.com/api/tasks"))
      .with_header(ACCEPT, HeaderValue::from_static("application/json"));

    let response = r.handle(BUCKET, request).await.unwrap();
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json().unwrap();
    assert_eq!(body["error"], "offline");
    assert!(body["message"].is_string());
  }

  #[tokio::test]
  async fn test_api_offline_without_json_accept_is_bare_503() {
    let r = router(Arc::new(MockTransport::offline()));
    let response = r
      .handle(BUCKET, HttpRequest::get(url("https://api.example.com/api/export.csv")))
      .await
      .unwrap();
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.body.is_empty());
  }

  #[tokio::test]
  async fn test_api_falls_back_to_last_good_response() {
    let transport = Arc::new(MockTransport::new(|_| {
      Ok(HttpResponse::json_body(StatusCode::OK, &serde_json::json!([{"id": "t1"}])))
    }));
    let r = router(transport.clone());
    let request = HttpRequest::get(url("https://api.example.com/api/tasks"));

    r.handle(BUCKET, request.clone()).await.unwrap();
    transport.set_online(false);

    let response = r.handle(BUCKET, request).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    let tasks: Value = response.json().unwrap();
    assert_eq!(tasks[0]["id"], "t1");
  }

  #[tokio::test]
  async fn test_api_post_is_never_stored() {
    let transport = Arc::new(MockTransport::ok());
    let r = router(transport.clone());
    let request = HttpRequest::new(Method::POST, url("https://api.example.com/api/tasks"));

    r.handle(BUCKET, request.clone()).await.unwrap();
    transport.set_online(false);
    let response = r.handle(BUCKET, request).await.unwrap();
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
  }

  #[tokio::test]
  async fn test_pass_through_surfaces_transport_errors() {
    let r = router(Arc::new(MockTransport::offline()));
    let request = HttpRequest::new(Method::POST, url("https://app.example.com/form"));
    let err = r.handle(BUCKET, request).await.unwrap_err();
    assert!(matches!(err, DaybookError::Network(_)));
  }

  #[tokio::test]
  async fn test_stale_static_asset_is_refetched_and_kept_for_offline() {
    let transport = Arc::new(MockTransport::ok());
    let cache = Arc::new(ResponseCache::open_in_memory().unwrap());
    let r = router_with_cache(transport.clone(), cache.clone());
    let request = HttpRequest::get(url("https://app.example.com/app.js"));

    r.handle(BUCKET, request.clone()).await.unwrap();
    cache.mark_stale(BUCKET, &Invalidation::All).unwrap();

    r.handle(BUCKET, request.clone()).await.unwrap();
    assert_eq!(transport.call_count(), 2);

    cache.mark_stale(BUCKET, &Invalidation::All).unwrap();
    transport.set_online(false);
    let response = r.handle(BUCKET, request).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
  }

  #[tokio::test]
  async fn test_stale_api_response_is_still_the_offline_fallback() {
    let transport = Arc::new(MockTransport::new(|_| {
      Ok(HttpResponse::json_body(StatusCode::OK, &serde_json::json!([{"id": "t1"}])))
    }));
    let cache = Arc::new(ResponseCache::open_in_memory().unwrap());
    let r = router_with_cache(transport.clone(), cache.clone());
    let request = HttpRequest::get(url("https://api.example.com/api/tasks"));

    r.handle(BUCKET, request.clone()).await.unwrap();
    transport.set_online(false);
    cache
      .mark_stale(BUCKET, &Invalidation::collection("tasks"))
      .unwrap();

    let response = r.handle(BUCKET, request).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    let tasks: Value = response.json().unwrap();
    assert_eq!(tasks[0]["id"], "t1");
  }
}
