//! Records kept in the local store.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::error::{DaybookError, Result};
use crate::http::HttpRequest;

/// Application task record, as the backend stores it.
///
/// Fields this layer does not care about survive the round trip through `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
  pub id: String,
  pub owner_id: String,
  pub title: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default)]
  pub completed: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub due_date: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl Task {
  pub fn new(id: impl Into<String>, owner_id: impl Into<String>, title: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      owner_id: owner_id.into(),
      title: title.into(),
      description: None,
      completed: false,
      due_date: None,
      extra: Map::new(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
  Synced,
  Pending,
}

impl SyncStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      SyncStatus::Synced => "synced",
      SyncStatus::Pending => "pending",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "synced" => Some(SyncStatus::Synced),
      "pending" => Some(SyncStatus::Pending),
      _ => None,
    }
  }
}

/// Local mirror of a task plus its sync bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalTask {
  pub task: Task,
  pub sync_status: SyncStatus,
  pub local_updated_at: DateTime<Utc>,
}

/// Server call a local task write still owes the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOp {
  Upsert,
  Delete,
}

impl TaskOp {
  pub fn as_str(&self) -> &'static str {
    match self {
      TaskOp::Upsert => "upsert",
      TaskOp::Delete => "delete",
    }
  }

  pub fn method(&self) -> Method {
    match self {
      TaskOp::Upsert => Method::POST,
      TaskOp::Delete => Method::DELETE,
    }
  }
}

/// Deterministic queue id for a task operation, e.g. `task:42:upsert`.
pub fn task_mutation_id(task_id: &str, op: TaskOp) -> String {
  format!("task:{}:{}", task_id, op.as_str())
}

/// Inverse of [`task_mutation_id`].
pub fn parse_task_mutation_id(id: &str) -> Option<(&str, TaskOp)> {
  let rest = id.strip_prefix("task:")?;
  let (task_id, op) = rest.rsplit_once(':')?;
  let op = match op {
    "upsert" => TaskOp::Upsert,
    "delete" => TaskOp::Delete,
    _ => return None,
  };
  (!task_id.is_empty()).then_some((task_id, op))
}

/// A write that could not reach the backend yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
  pub id: String,
  pub url: String,
  pub method: String,
  pub body: Option<Value>,
  pub timestamp: DateTime<Utc>,
  pub attempts: u32,
  /// When the most recent failed attempt happened
  pub last_attempt_at: Option<DateTime<Utc>>,
}

impl PendingMutation {
  pub fn new(
    id: impl Into<String>,
    url: impl Into<String>,
    method: impl Into<String>,
    body: Option<Value>,
  ) -> Self {
    Self {
      id: id.into(),
      url: url.into(),
      method: method.into(),
      body,
      timestamp: super::now(),
      attempts: 0,
      last_attempt_at: None,
    }
  }

  /// Rebuild the HTTP call this record describes.
  pub fn to_request(&self) -> Result<HttpRequest> {
    let method = Method::from_bytes(self.method.as_bytes())
      .map_err(|e| DaybookError::Other(format!("Invalid method '{}': {}", self.method, e)))?;
    let url = Url::parse(&self.url)
      .map_err(|e| DaybookError::Other(format!("Invalid URL '{}': {}", self.url, e)))?;

    let request = HttpRequest::new(method, url);
    match &self.body {
      Some(body) => request.with_json(body),
      None => Ok(request),
    }
  }

  /// Earliest time a drain pass should retry this record.
  ///
  /// Doubles with each failure, capped at `max`. A zero base disables backoff.
  pub fn next_attempt_at(&self, base: Duration, max: Duration) -> DateTime<Utc> {
    let Some(last) = self.last_attempt_at else {
      return self.timestamp;
    };
    if self.attempts == 0 || base.is_zero() {
      return last;
    }

    let shift = (self.attempts - 1).min(16);
    let delay = base.saturating_mul(1u32 << shift).min(max);
    // a delay chrono cannot represent means "not in this lifetime"
    chrono::Duration::from_std(delay)
      .ok()
      .and_then(|delay| last.checked_add_signed(delay))
      .unwrap_or(DateTime::<Utc>::MAX_UTC)
  }
}

/// Per-user sync bookkeeping and preferences.
#[derive(Debug, Clone, PartialEq)]
pub struct UserSyncMetadata {
  pub id: String,
  pub last_sync_timestamp: DateTime<Utc>,
  pub preferences: Map<String, Value>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_task_keeps_unknown_fields() {
    let raw = json!({
      "id": "t1",
      "owner_id": "u1",
      "title": "Water plants",
      "priority": "high",
      "tags": ["home"]
    });
    let task: Task = serde_json::from_value(raw.clone()).unwrap();
    assert_eq!(task.title, "Water plants");
    assert!(!task.completed);
    assert_eq!(task.extra["priority"], "high");

    let back = serde_json::to_value(&task).unwrap();
    assert_eq!(back["tags"], json!(["home"]));
    assert_eq!(back["completed"], false);
  }

  #[test]
  fn test_mutation_id_round_trip() {
    let id = task_mutation_id("a:b", TaskOp::Delete);
    assert_eq!(id, "task:a:b:delete");
    assert_eq!(parse_task_mutation_id(&id), Some(("a:b", TaskOp::Delete)));
    assert_eq!(parse_task_mutation_id("habit:1:upsert"), None);
    assert_eq!(parse_task_mutation_id("task::upsert"), None);
    assert_eq!(parse_task_mutation_id("task:1:archive"), None);
  }

  #[test]
  fn test_to_request() {
    let mutation = PendingMutation::new(
      "task:1:upsert",
      "https://api.example.com/tasks",
      "POST",
      Some(json!({"id": "1"})),
    );
    let request = mutation.to_request().unwrap();
    assert_eq!(request.method, Method::POST);
    assert_eq!(request.url.path(), "/tasks");
    assert_eq!(request.body.as_deref(), Some(br#"{"id":"1"}"#.as_slice()));

    let broken = PendingMutation::new("x", "not a url", "GET", None);
    assert!(broken.to_request().is_err());
  }

  #[test]
  fn test_next_attempt_backoff() {
    let mut mutation = PendingMutation::new("x", "https://api.example.com/tasks", "POST", None);
    let base = Duration::from_secs(1);
    let max = Duration::from_secs(60);
    assert_eq!(mutation.next_attempt_at(base, max), mutation.timestamp);

    let last = mutation.timestamp;
    mutation.last_attempt_at = Some(last);
    mutation.attempts = 1;
    assert_eq!(mutation.next_attempt_at(base, max), last + chrono::Duration::seconds(1));

    mutation.attempts = 3;
    assert_eq!(mutation.next_attempt_at(base, max), last + chrono::Duration::seconds(4));

    mutation.attempts = 10;
    assert_eq!(mutation.next_attempt_at(base, max), last + chrono::Duration::seconds(60));

    assert_eq!(mutation.next_attempt_at(Duration::ZERO, max), last);
  }

  #[test]
  fn test_next_attempt_with_unbounded_backoff_does_not_overflow() {
    let mut mutation = PendingMutation::new("x", "https://api.example.com/tasks", "POST", None);
    mutation.last_attempt_at = Some(mutation.timestamp);
    mutation.attempts = 17;

    let at = mutation.next_attempt_at(Duration::from_secs(u64::MAX / 4), Duration::MAX);
    assert_eq!(at, DateTime::<Utc>::MAX_UTC);
  }
}
