//! Named response buckets kept by the proxy.
//!
//! One bucket per proxy version. Activation deletes every bucket that is not
//! the current one; inside a bucket entries are bounded by count and age.
//! Invalidated entries are only marked stale: they stay around as the offline
//! fallback until a fresh response replaces them.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::{DaybookError, Result};
use crate::http::{HttpRequest, HttpResponse};
use crate::invalidation::Invalidation;
use crate::store::{format_timestamp, now, timestamp_column};

const BUCKET_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS response_buckets (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- access_seq orders entries by last use within a bucket
CREATE TABLE IF NOT EXISTS cached_responses (
    bucket TEXT NOT NULL,
    request_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    access_seq INTEGER NOT NULL,
    stale INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (bucket, request_key)
);

CREATE INDEX IF NOT EXISTS idx_cached_responses_access
    ON cached_responses(bucket, access_seq);
"#;

/// Bounds applied within a single bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionPolicy {
  /// Keep at most this many entries, dropping the least recently used
  pub max_entries: Option<usize>,
  /// Entries older than this are misses
  pub max_age: Option<Duration>,
}

/// A stored response and whether it has been invalidated since it was stored.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: HttpResponse,
  pub stale: bool,
}

/// SQLite-backed bucket store.
pub struct ResponseCache {
  conn: Mutex<Connection>,
}

impl ResponseCache {
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    Self::with_connection(Connection::open(path)?)
  }

  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn.execute_batch(BUCKET_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|_| DaybookError::lock_poisoned("response cache"))
  }

  /// Create the bucket if it does not exist yet.
  pub fn open_bucket(&self, name: &str) -> Result<()> {
    self.conn()?.execute(
      "INSERT OR IGNORE INTO response_buckets (name, created_at) VALUES (?, ?)",
      params![name, format_timestamp(&now())],
    )?;
    Ok(())
  }

  pub fn bucket_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare("SELECT name FROM response_buckets ORDER BY created_at, name")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
  }

  /// Drop a bucket and everything in it. Returns whether it existed.
  pub fn delete_bucket(&self, name: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM cached_responses WHERE bucket = ?", params![name])?;
    let deleted = tx.execute("DELETE FROM response_buckets WHERE name = ?", params![name])?;
    tx.commit()?;
    Ok(deleted > 0)
  }

  /// Store a response for `request`, then trim the bucket to `policy`.
  pub fn put(
    &self,
    bucket: &str,
    request: &HttpRequest,
    response: &HttpResponse,
    policy: &EvictionPolicy,
  ) -> Result<()> {
    let headers = serde_json::to_string(&header_pairs(&response.headers))?;
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;

    tx.execute(
      "INSERT OR IGNORE INTO response_buckets (name, created_at) VALUES (?, ?)",
      params![bucket, format_timestamp(&now())],
    )?;
    let seq = next_access_seq(&tx, bucket)?;
    tx.execute(
      "INSERT OR REPLACE INTO cached_responses
       (bucket, request_key, method, url, status, headers, body, stored_at, access_seq, stale)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
      params![
        bucket,
        request.cache_key(),
        request.method.as_str(),
        request.url.as_str(),
        response.status.as_u16(),
        headers,
        response.body,
        format_timestamp(&now()),
        seq
      ],
    )?;

    if let Some(max_entries) = policy.max_entries {
      let evicted = tx.execute(
        "DELETE FROM cached_responses WHERE bucket = ?1 AND request_key IN (
           SELECT request_key FROM cached_responses WHERE bucket = ?1
           ORDER BY access_seq DESC LIMIT -1 OFFSET ?2
         )",
        params![bucket, i64::try_from(max_entries).unwrap_or(i64::MAX)],
      )?;
      if evicted > 0 {
        debug!(bucket, evicted, "evicted least recently used responses");
      }
    }

    tx.commit()?;
    Ok(())
  }

  /// Look up the stored response for `request`.
  ///
  /// A hit counts as a use for LRU purposes. An entry past `max_age` is
  /// deleted and reported as a miss.
  pub fn match_request(
    &self,
    bucket: &str,
    request: &HttpRequest,
    policy: &EvictionPolicy,
  ) -> Result<Option<CachedResponse>> {
    let key = request.cache_key();
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;

    let row = tx
      .query_row(
        "SELECT status, headers, body, stored_at, stale FROM cached_responses
         WHERE bucket = ? AND request_key = ?",
        params![bucket, key],
        |row| {
          Ok((
            row.get::<_, u16>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Vec<u8>>(2)?,
            timestamp_column(row, 3)?,
            row.get::<_, bool>(4)?,
          ))
        },
      )
      .optional()?;

    let Some((status, headers, body, stored_at, stale)) = row else {
      return Ok(None);
    };

    // an age too large for chrono never expires
    if let Some(max_age) = policy
      .max_age
      .and_then(|age| chrono::Duration::from_std(age).ok())
    {
      if stored_at
        .checked_add_signed(max_age)
        .is_some_and(|expiry| expiry <= now())
      {
        tx.execute(
          "DELETE FROM cached_responses WHERE bucket = ? AND request_key = ?",
          params![bucket, key],
        )?;
        tx.commit()?;
        debug!(bucket, url = %request.url, "cached response expired");
        return Ok(None);
      }
    }

    let seq = next_access_seq(&tx, bucket)?;
    tx.execute(
      "UPDATE cached_responses SET access_seq = ? WHERE bucket = ? AND request_key = ?",
      params![seq, bucket, key],
    )?;
    tx.commit()?;

    let status = StatusCode::from_u16(status)
      .map_err(|e| DaybookError::Other(format!("Invalid cached status {}: {}", status, e)))?;
    let pairs: Vec<(String, String)> = serde_json::from_str(&headers)?;
    Ok(Some(CachedResponse {
      response: HttpResponse {
        status,
        headers: header_map(&pairs),
        body,
      },
      stale,
    }))
  }

  /// Mark every entry whose URL path matches `invalidation` as stale.
  pub fn mark_stale(&self, bucket: &str, invalidation: &Invalidation) -> Result<usize> {
    self.update_matching(
      bucket,
      invalidation,
      "UPDATE cached_responses SET stale = 1
       WHERE bucket = ? AND request_key = ? AND stale = 0",
    )
  }

  /// Delete every entry whose URL path matches `invalidation`.
  pub fn delete_matching(&self, bucket: &str, invalidation: &Invalidation) -> Result<usize> {
    self.update_matching(
      bucket,
      invalidation,
      "DELETE FROM cached_responses WHERE bucket = ? AND request_key = ?",
    )
  }

  /// Run `statement` with (bucket, request_key) for every matching entry.
  fn update_matching(
    &self,
    bucket: &str,
    invalidation: &Invalidation,
    statement: &str,
  ) -> Result<usize> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;

    let entries: Vec<(String, String)> = {
      let mut stmt = tx.prepare("SELECT request_key, url FROM cached_responses WHERE bucket = ?")?;
      let rows = stmt.query_map(params![bucket], |row| Ok((row.get(0)?, row.get(1)?)))?;
      rows.collect::<rusqlite::Result<_>>()?
    };

    let mut changed = 0;
    for (key, url) in entries {
      let path = url::Url::parse(&url)
        .map(|u| u.path().to_string())
        .unwrap_or(url);
      if invalidation.matches_path(&path) {
        changed += tx.execute(statement, params![bucket, key])?;
      }
    }

    tx.commit()?;
    Ok(changed)
  }

  pub fn len(&self, bucket: &str) -> Result<usize> {
    let count: i64 = self.conn()?.query_row(
      "SELECT COUNT(*) FROM cached_responses WHERE bucket = ?",
      params![bucket],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }
}

fn next_access_seq(conn: &Connection, bucket: &str) -> rusqlite::Result<i64> {
  conn.query_row(
    "SELECT COALESCE(MAX(access_seq), 0) + 1 FROM cached_responses WHERE bucket = ?",
    params![bucket],
    |row| row.get(0),
  )
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
  headers
    .iter()
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect()
}

fn header_map(pairs: &[(String, String)]) -> HeaderMap {
  let mut headers = HeaderMap::new();
  for (name, value) in pairs {
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      headers.append(name, value);
    }
  }
  headers
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::header::CONTENT_TYPE;
  use url::Url;

  fn get(url: &str) -> HttpRequest {
    HttpRequest::get(Url::parse(url).unwrap())
  }

  fn body(text: &str) -> HttpResponse {
    let mut response = HttpResponse::new(StatusCode::OK);
    response
      .headers
      .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response.body = text.as_bytes().to_vec();
    response
  }

  #[test]
  fn test_put_and_match() {
    let cache = ResponseCache::open_in_memory().unwrap();
    let policy = EvictionPolicy::default();
    let request = get("https://app.example.com/index.html");
    cache.put("daybook-v1", &request, &body("<html>"), &policy).unwrap();

    let hit = cache.match_request("daybook-v1", &request, &policy).unwrap().unwrap();
    assert!(!hit.stale);
    assert_eq!(hit.response.status, StatusCode::OK);
    assert_eq!(hit.response.body, b"<html>");
    assert_eq!(hit.response.headers[CONTENT_TYPE], "text/plain");

    assert!(cache.match_request("daybook-v2", &request, &policy).unwrap().is_none());
    assert!(cache
      .match_request("daybook-v1", &get("https://app.example.com/other.js"), &policy)
      .unwrap()
      .is_none());
  }

  #[test]
  fn test_delete_bucket() {
    let cache = ResponseCache::open_in_memory().unwrap();
    let policy = EvictionPolicy::default();
    cache.open_bucket("daybook-v1").unwrap();
    cache
      .put("daybook-v2", &get("https://app.example.com/"), &body("x"), &policy)
      .unwrap();
    assert_eq!(cache.bucket_names().unwrap().len(), 2);

    assert!(cache.delete_bucket("daybook-v2").unwrap());
    assert!(!cache.delete_bucket("daybook-v2").unwrap());
    assert_eq!(cache.bucket_names().unwrap(), vec!["daybook-v1".to_string()]);
    assert_eq!(cache.len("daybook-v2").unwrap(), 0);
  }

  #[test]
  fn test_lru_eviction_keeps_recently_used() {
    let cache = ResponseCache::open_in_memory().unwrap();
    let policy = EvictionPolicy {
      max_entries: Some(2),
      max_age: None,
    };
    let a = get("https://app.example.com/a.js");
    let b = get("https://app.example.com/b.js");
    let c = get("https://app.example.com/c.js");

    cache.put("v1", &a, &body("a"), &policy).unwrap();
    cache.put("v1", &b, &body("b"), &policy).unwrap();
    // touching `a` makes `b` the oldest
    assert!(cache.match_request("v1", &a, &policy).unwrap().is_some());
    cache.put("v1", &c, &body("c"), &policy).unwrap();

    assert_eq!(cache.len("v1").unwrap(), 2);
    assert!(cache.match_request("v1", &a, &policy).unwrap().is_some());
    assert!(cache.match_request("v1", &b, &policy).unwrap().is_none());
    assert!(cache.match_request("v1", &c, &policy).unwrap().is_some());
  }

  #[test]
  fn test_max_age_expires_entries() {
    let cache = ResponseCache::open_in_memory().unwrap();
    let request = get("https://app.example.com/a.js");
    cache
      .put("v1", &request, &body("a"), &EvictionPolicy::default())
      .unwrap();

    let generous = EvictionPolicy {
      max_entries: None,
      max_age: Some(Duration::from_secs(3600)),
    };
    assert!(cache.match_request("v1", &request, &generous).unwrap().is_some());

    let expired = EvictionPolicy {
      max_entries: None,
      max_age: Some(Duration::ZERO),
    };
    assert!(cache.match_request("v1", &request, &expired).unwrap().is_none());
    assert_eq!(cache.len("v1").unwrap(), 0);
  }

  #[test]
  fn test_delete_matching_by_collection() {
    let cache = ResponseCache::open_in_memory().unwrap();
    let policy = EvictionPolicy::default();
    for url in [
      "https://api.example.com/api/tasks",
      "https://api.example.com/api/tasks/7",
      "https://api.example.com/api/habits",
    ] {
      cache.put("v1", &get(url), &body("{}"), &policy).unwrap();
    }

    let deleted = cache
      .delete_matching("v1", &Invalidation::collection("tasks"))
      .unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(cache.len("v1").unwrap(), 1);

    cache.delete_matching("v1", &Invalidation::All).unwrap();
    assert_eq!(cache.len("v1").unwrap(), 0);
  }

  #[test]
  fn test_mark_stale_keeps_entries_until_replaced() {
    let cache = ResponseCache::open_in_memory().unwrap();
    let policy = EvictionPolicy::default();
    let tasks = get("https://api.example.com/api/tasks");
    let habits = get("https://api.example.com/api/habits");
    cache.put("v1", &tasks, &body("[1]"), &policy).unwrap();
    cache.put("v1", &habits, &body("[2]"), &policy).unwrap();

    let marked = cache
      .mark_stale("v1", &Invalidation::collection("tasks"))
      .unwrap();
    assert_eq!(marked, 1);
    assert_eq!(cache.len("v1").unwrap(), 2);

    let hit = cache.match_request("v1", &tasks, &policy).unwrap().unwrap();
    assert!(hit.stale);
    assert_eq!(hit.response.body, b"[1]");
    assert!(!cache.match_request("v1", &habits, &policy).unwrap().unwrap().stale);

    // a fresh store clears the flag
    cache.put("v1", &tasks, &body("[3]"), &policy).unwrap();
    let hit = cache.match_request("v1", &tasks, &policy).unwrap().unwrap();
    assert!(!hit.stale);
    assert_eq!(hit.response.body, b"[3]");
  }

  #[test]
  fn test_huge_max_entries_keeps_everything() {
    let cache = ResponseCache::open_in_memory().unwrap();
    let policy = EvictionPolicy {
      max_entries: Some(usize::MAX),
      max_age: None,
    };
    for url in ["https://app.example.com/a.js", "https://app.example.com/b.js"] {
      cache.put("v1", &get(url), &body("x"), &policy).unwrap();
    }
    assert_eq!(cache.len("v1").unwrap(), 2);
  }
}
