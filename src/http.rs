//! Transport seam between the client and the backend.
//!
//! Everything that talks to the network goes through [`Transport`], so the
//! proxy can sit in front of the real client and tests can script failures.

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{DaybookError, Result};

/// A request as seen by the proxy and the sync coordinator.
#[derive(Debug, Clone)]
pub struct HttpRequest {
  pub method: Method,
  pub url: Url,
  pub headers: HeaderMap,
  pub body: Option<Vec<u8>>,
}

impl HttpRequest {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: HeaderMap::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
    self.headers.insert(name, value);
    self
  }

  /// Attach a JSON body and the matching content type.
  pub fn with_json(mut self, body: &serde_json::Value) -> Result<Self> {
    self.body = Some(serde_json::to_vec(body)?);
    self
      .headers
      .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(self)
  }

  /// Whether the caller declared it accepts a JSON response.
  pub fn accepts_json(&self) -> bool {
    self
      .headers
      .get_all(ACCEPT)
      .iter()
      .filter_map(|v| v.to_str().ok())
      .any(|v| v.contains("application/json"))
  }

  /// Stable identity used to key stored responses.
  pub fn cache_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
  pub status: StatusCode,
  pub headers: HeaderMap,
  pub body: Vec<u8>,
}

impl HttpResponse {
  pub fn new(status: StatusCode) -> Self {
    Self {
      status,
      headers: HeaderMap::new(),
      body: Vec::new(),
    }
  }

  pub fn json_body(status: StatusCode, body: &serde_json::Value) -> Self {
    let mut response = Self::new(status);
    response
      .headers
      .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    // serializing a Value cannot fail
    response.body = serde_json::to_vec(body).unwrap_or_default();
    response
  }

  /// Response synthesized when neither the network nor the bucket can answer.
  pub fn offline(accepts_json: bool) -> Self {
    if accepts_json {
      Self::json_body(
        StatusCode::SERVICE_UNAVAILABLE,
        &serde_json::json!({
          "error": "offline",
          "message": "You are offline and this data has not been cached yet.",
        }),
      )
    } else {
      Self::new(StatusCode::SERVICE_UNAVAILABLE)
    }
  }

  /// 2xx, the same notion as `Response.ok`.
  pub fn is_ok(&self) -> bool {
    self.status.is_success()
  }

  pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
    Ok(serde_json::from_slice(&self.body)?)
  }

  /// Turn a non-2xx response into a [`DaybookError::Server`].
  pub fn error_for_status(self) -> Result<Self> {
    if self.is_ok() {
      Ok(self)
    } else {
      Err(DaybookError::Server {
        status: self.status.as_u16(),
      })
    }
  }
}

/// Something that can execute requests.
///
/// A non-2xx response is still `Ok`; only transport failures are `Err`.
pub trait Transport: Send + Sync {
  fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>>;
}

/// reqwest-backed transport that talks to the real network.
#[derive(Clone)]
pub struct HttpTransport {
  client: Client,
}

impl HttpTransport {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = Client::builder()
      .timeout(timeout)
      .user_agent(concat!("daybook/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| DaybookError::Network(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self { client })
  }

  async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
    let mut builder = self
      .client
      .request(request.method, request.url)
      .headers(request.headers);
    if let Some(body) = request.body {
      builder = builder.body(body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| DaybookError::Network(e.to_string()))?;

    let status = response.status();
    let headers = response.headers().clone();
    let body = response
      .bytes()
      .await
      .map_err(|e| DaybookError::Network(format!("Failed to read response body: {}", e)))?
      .to_vec();

    Ok(HttpResponse {
      status,
      headers,
      body,
    })
  }
}

impl Transport for HttpTransport {
  fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
    Box::pin(self.execute(request))
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_cache_key_depends_on_method_and_url() {
    let a = HttpRequest::get(url("https://api.example.com/tasks"));
    let b = HttpRequest::get(url("https://api.example.com/tasks"));
    let c = HttpRequest::new(Method::POST, url("https://api.example.com/tasks"));
    let d = HttpRequest::get(url("https://api.example.com/habits"));

    assert_eq!(a.cache_key(), b.cache_key());
    assert_ne!(a.cache_key(), c.cache_key());
    assert_ne!(a.cache_key(), d.cache_key());
    assert_eq!(a.cache_key().len(), 64);
  }

  #[test]
  fn test_accepts_json() {
    let plain = HttpRequest::get(url("https://example.com/app.js"));
    assert!(!plain.accepts_json());

    let json = plain.clone().with_header(
      ACCEPT,
      HeaderValue::from_static("application/json, text/plain"),
    );
    assert!(json.accepts_json());
  }

  #[test]
  fn test_offline_response_shapes() {
    let json = HttpResponse::offline(true);
    assert_eq!(json.status, StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = json.json().unwrap();
    assert_eq!(body["error"], "offline");
    assert!(body["message"].is_string());

    let bare = HttpResponse::offline(false);
    assert_eq!(bare.status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(bare.body.is_empty());
  }

  #[test]
  fn test_error_for_status() {
    assert!(HttpResponse::new(StatusCode::NO_CONTENT)
      .error_for_status()
      .is_ok());
    let err = HttpResponse::new(StatusCode::BAD_GATEWAY)
      .error_for_status()
      .unwrap_err();
    assert!(matches!(err, DaybookError::Server { status: 502 }));
  }
}
