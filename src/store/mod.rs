//! Durable local store: task mirror, pending-mutation queue and user metadata.
//!
//! This is the single authoritative offline state. Everything is synchronous
//! SQLite behind a mutex; calls are short and never span a network round trip.

pub mod schema;
mod types;

pub use types::{
  parse_task_mutation_id, task_mutation_id, LocalTask, PendingMutation, SyncStatus, Task, TaskOp,
  UserSyncMetadata,
};

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{DaybookError, Result};

/// Current time at the precision the store keeps.
pub(crate) fn now() -> DateTime<Utc> {
  Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339, so text order is time order.
pub(crate) fn format_timestamp(dt: &DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn timestamp_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
  let raw: String = row.get(idx)?;
  DateTime::parse_from_rfc3339(&raw)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_column<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
  let raw: String = row.get(idx)?;
  serde_json::from_str(&raw)
    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn local_task_from_row(row: &Row) -> rusqlite::Result<LocalTask> {
  let status: String = row.get(1)?;
  let sync_status = SyncStatus::parse(&status).ok_or_else(|| {
    rusqlite::Error::FromSqlConversionFailure(
      1,
      Type::Text,
      format!("unknown sync status '{}'", status).into(),
    )
  })?;

  Ok(LocalTask {
    task: json_column(row, 0)?,
    sync_status,
    local_updated_at: timestamp_column(row, 2)?,
  })
}

fn mutation_from_row(row: &Row) -> rusqlite::Result<PendingMutation> {
  let body: Option<String> = row.get(3)?;
  let body = body
    .map(|raw| serde_json::from_str(&raw))
    .transpose()
    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
  let last_attempt_at = match row.get::<_, Option<String>>(6)? {
    Some(_) => Some(timestamp_column(row, 6)?),
    None => None,
  };

  Ok(PendingMutation {
    id: row.get(0)?,
    url: row.get(1)?,
    method: row.get(2)?,
    body,
    timestamp: timestamp_column(row, 4)?,
    attempts: row.get(5)?,
    last_attempt_at,
  })
}

const MUTATION_COLUMNS: &str = "id, url, method, body, timestamp, attempts, last_attempt_at";

/// SQLite-backed local store.
pub struct LocalStore {
  conn: Mutex<Connection>,
}

impl LocalStore {
  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    Self::with_connection(conn)
  }

  /// Store that lives only as long as the value.
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn.execute_batch(schema::SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|_| DaybookError::lock_poisoned("local store"))
  }

  // ==========================================================================
  // Task mirror
  // ==========================================================================

  /// Upsert the local copy of a task.
  pub fn save_task(&self, task: &Task, sync_status: SyncStatus) -> Result<LocalTask> {
    let local = LocalTask {
      task: task.clone(),
      sync_status,
      local_updated_at: now(),
    };
    let data = serde_json::to_string(task)?;

    self.conn()?.execute(
      "INSERT OR REPLACE INTO tasks (id, owner_id, data, sync_status, local_updated_at)
       VALUES (?, ?, ?, ?, ?)",
      params![
        task.id,
        task.owner_id,
        data,
        sync_status.as_str(),
        format_timestamp(&local.local_updated_at)
      ],
    )?;

    Ok(local)
  }

  /// All mirrored tasks for an owner, most recently touched first.
  pub fn get_tasks(&self, owner_id: &str) -> Result<Vec<LocalTask>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare(
      "SELECT data, sync_status, local_updated_at FROM tasks
       WHERE owner_id = ?
       ORDER BY local_updated_at DESC",
    )?;

    let tasks = stmt
      .query_map(params![owner_id], local_task_from_row)?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tasks)
  }

  pub fn get_task(&self, task_id: &str) -> Result<Option<LocalTask>> {
    let conn = self.conn()?;
    let task = conn
      .query_row(
        "SELECT data, sync_status, local_updated_at FROM tasks WHERE id = ?",
        params![task_id],
        local_task_from_row,
      )
      .optional()?;
    Ok(task)
  }

  /// Remove a task from the mirror. Returns whether it existed.
  pub fn delete_task(&self, task_id: &str) -> Result<bool> {
    let deleted = self
      .conn()?
      .execute("DELETE FROM tasks WHERE id = ?", params![task_id])?;
    Ok(deleted > 0)
  }

  /// Flip a mirrored task's sync status. Returns whether the task exists.
  pub fn set_task_status(&self, task_id: &str, sync_status: SyncStatus) -> Result<bool> {
    let updated = self.conn()?.execute(
      "UPDATE tasks SET sync_status = ? WHERE id = ?",
      params![sync_status.as_str(), task_id],
    )?;
    Ok(updated > 0)
  }

  // ==========================================================================
  // Pending mutation queue
  // ==========================================================================

  /// Append a write to the queue with `attempts = 0`.
  ///
  /// Queuing an id that is already pending replaces the older record.
  pub fn queue_request(
    &self,
    id: &str,
    url: &str,
    method: &str,
    body: Option<&Value>,
  ) -> Result<PendingMutation> {
    let mutation = PendingMutation::new(id, url, method, body.cloned());
    self.insert_mutation(&mutation)?;
    debug!(id, method, url, "queued mutation");
    Ok(mutation)
  }

  /// Insert or replace a full queue record.
  pub fn insert_mutation(&self, mutation: &PendingMutation) -> Result<()> {
    let body = mutation
      .body
      .as_ref()
      .map(serde_json::to_string)
      .transpose()?;

    self.conn()?.execute(
      "INSERT OR REPLACE INTO pending_requests
       (id, url, method, body, timestamp, attempts, last_attempt_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        mutation.id,
        mutation.url,
        mutation.method,
        body,
        format_timestamp(&mutation.timestamp),
        mutation.attempts,
        mutation.last_attempt_at.as_ref().map(format_timestamp)
      ],
    )?;
    Ok(())
  }

  /// Every queued mutation, oldest first.
  pub fn pending_requests(&self) -> Result<Vec<PendingMutation>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare(&format!(
      "SELECT {} FROM pending_requests ORDER BY timestamp ASC, rowid ASC",
      MUTATION_COLUMNS
    ))?;

    let mutations = stmt
      .query_map([], mutation_from_row)?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(mutations)
  }

  pub fn get_pending(&self, id: &str) -> Result<Option<PendingMutation>> {
    let conn = self.conn()?;
    let mutation = conn
      .query_row(
        &format!("SELECT {} FROM pending_requests WHERE id = ?", MUTATION_COLUMNS),
        params![id],
        mutation_from_row,
      )
      .optional()?;
    Ok(mutation)
  }

  /// Persist a failed attempt against exactly this record.
  ///
  /// Returns false when the record was replaced or removed in the meantime.
  pub fn record_failed_attempt(
    &self,
    mutation: &PendingMutation,
    attempts: u32,
    at: DateTime<Utc>,
  ) -> Result<bool> {
    let updated = self.conn()?.execute(
      "UPDATE pending_requests SET attempts = ?, last_attempt_at = ?
       WHERE id = ? AND timestamp = ?",
      params![
        attempts,
        format_timestamp(&at),
        mutation.id,
        format_timestamp(&mutation.timestamp)
      ],
    )?;
    Ok(updated > 0)
  }

  /// Delete exactly this record, leaving a newer one queued under the same id alone.
  pub fn resolve_pending(&self, mutation: &PendingMutation) -> Result<bool> {
    let deleted = self.conn()?.execute(
      "DELETE FROM pending_requests WHERE id = ? AND timestamp = ?",
      params![mutation.id, format_timestamp(&mutation.timestamp)],
    )?;
    Ok(deleted > 0)
  }

  /// Remove a queued mutation. Returns whether it existed.
  pub fn delete_pending(&self, id: &str) -> Result<bool> {
    let deleted = self
      .conn()?
      .execute("DELETE FROM pending_requests WHERE id = ?", params![id])?;
    Ok(deleted > 0)
  }

  pub fn pending_count(&self) -> Result<usize> {
    let count: i64 = self
      .conn()?
      .query_row("SELECT COUNT(*) FROM pending_requests", [], |row| row.get(0))?;
    Ok(count as usize)
  }

  // ==========================================================================
  // User sync metadata
  // ==========================================================================

  /// Shallow-merge `patch` into a user's preferences, creating the row if needed.
  pub fn update_user_preferences(
    &self,
    user_id: &str,
    patch: &Map<String, Value>,
  ) -> Result<UserSyncMetadata> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;

    let existing: Option<Map<String, Value>> = tx
      .query_row(
        "SELECT preferences FROM user_sync_metadata WHERE id = ?",
        params![user_id],
        |row| json_column(row, 0),
      )
      .optional()?;

    let mut preferences = existing.unwrap_or_default();
    for (key, value) in patch {
      preferences.insert(key.clone(), value.clone());
    }

    let metadata = UserSyncMetadata {
      id: user_id.to_string(),
      last_sync_timestamp: now(),
      preferences,
    };

    tx.execute(
      "INSERT OR REPLACE INTO user_sync_metadata (id, last_sync_timestamp, preferences)
       VALUES (?, ?, ?)",
      params![
        metadata.id,
        format_timestamp(&metadata.last_sync_timestamp),
        serde_json::to_string(&metadata.preferences)?
      ],
    )?;
    tx.commit()?;

    Ok(metadata)
  }

  /// A user's preferences; empty when nothing was ever written.
  pub fn get_user_preferences(&self, user_id: &str) -> Result<Map<String, Value>> {
    Ok(
      self
        .get_user_metadata(user_id)?
        .map(|m| m.preferences)
        .unwrap_or_default(),
    )
  }

  pub fn get_user_metadata(&self, user_id: &str) -> Result<Option<UserSyncMetadata>> {
    let conn = self.conn()?;
    let metadata = conn
      .query_row(
        "SELECT id, last_sync_timestamp, preferences FROM user_sync_metadata WHERE id = ?",
        params![user_id],
        |row| {
          Ok(UserSyncMetadata {
            id: row.get(0)?,
            last_sync_timestamp: timestamp_column(row, 1)?,
            preferences: json_column(row, 2)?,
          })
        },
      )
      .optional()?;
    Ok(metadata)
  }

  /// Record a completed sync for a user that already has metadata.
  pub fn touch_last_sync(&self, user_id: &str) -> Result<bool> {
    let updated = self.conn()?.execute(
      "UPDATE user_sync_metadata SET last_sync_timestamp = ? WHERE id = ?",
      params![format_timestamp(&now()), user_id],
    )?;
    Ok(updated > 0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tempfile::TempDir;

  fn store() -> LocalStore {
    LocalStore::open_in_memory().unwrap()
  }

  #[test]
  fn test_save_and_get_tasks() {
    let store = store();
    let mut task = Task::new("t1", "u1", "Stretch");
    store.save_task(&task, SyncStatus::Pending).unwrap();
    store
      .save_task(&Task::new("t2", "u2", "Other user"), SyncStatus::Synced)
      .unwrap();

    let tasks = store.get_tasks("u1").unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task, task);
    assert_eq!(tasks[0].sync_status, SyncStatus::Pending);

    // Upsert overwrites in place
    task.completed = true;
    let saved = store.save_task(&task, SyncStatus::Synced).unwrap();
    let stored = store.get_task("t1").unwrap().unwrap();
    assert_eq!(stored, saved);
    assert!(stored.task.completed);
    assert_eq!(store.get_tasks("u1").unwrap().len(), 1);
  }

  #[test]
  fn test_set_status_and_delete() {
    let store = store();
    store
      .save_task(&Task::new("t1", "u1", "Read"), SyncStatus::Pending)
      .unwrap();

    assert!(store.set_task_status("t1", SyncStatus::Synced).unwrap());
    assert_eq!(
      store.get_task("t1").unwrap().unwrap().sync_status,
      SyncStatus::Synced
    );
    assert!(!store.set_task_status("missing", SyncStatus::Synced).unwrap());

    assert!(store.delete_task("t1").unwrap());
    assert!(store.get_task("t1").unwrap().is_none());
    assert!(!store.delete_task("t1").unwrap());
  }

  #[test]
  fn test_queue_request_starts_at_zero_attempts() {
    let store = store();
    let body = json!({"id": "t1"});
    let queued = store
      .queue_request("task:t1:upsert", "https://api.example.com/tasks", "POST", Some(&body))
      .unwrap();

    assert_eq!(queued.attempts, 0);
    assert_eq!(store.get_pending("task:t1:upsert").unwrap(), Some(queued));
    assert_eq!(store.pending_count().unwrap(), 1);
  }

  #[test]
  fn test_requeue_same_id_replaces_record() {
    let store = store();
    let url = "https://api.example.com/tasks";
    let mut first = PendingMutation::new("task:t1:upsert", url, "POST", Some(json!({"v": 1})));
    first.timestamp = now() - chrono::Duration::seconds(5);
    store.insert_mutation(&first).unwrap();
    assert!(store.record_failed_attempt(&first, 3, now()).unwrap());

    store
      .queue_request("task:t1:upsert", url, "POST", Some(&json!({"v": 2})))
      .unwrap();

    let pending = store.pending_requests().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 0);
    assert_eq!(pending[0].body, Some(json!({"v": 2})));

    // The superseded record can no longer be touched
    assert!(!store.record_failed_attempt(&first, 4, now()).unwrap());
    assert!(!store.resolve_pending(&first).unwrap());
    assert_eq!(store.pending_count().unwrap(), 1);
  }

  #[test]
  fn test_pending_requests_sorted_by_timestamp() {
    let store = store();
    let base = now();
    for (id, offset) in [("c", 3), ("a", 1), ("b", 2)] {
      let mut mutation = PendingMutation::new(id, "https://api.example.com/x", "POST", None);
      mutation.timestamp = base + chrono::Duration::seconds(offset);
      store.insert_mutation(&mutation).unwrap();
    }

    let ids: Vec<String> = store
      .pending_requests()
      .unwrap()
      .into_iter()
      .map(|m| m.id)
      .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
  }

  #[test]
  fn test_record_failed_attempt_and_delete() {
    let store = store();
    let queued = store
      .queue_request("m1", "https://api.example.com/x", "DELETE", None)
      .unwrap();
    let at = now();
    assert!(store.record_failed_attempt(&queued, 2, at).unwrap());

    let pending = store.get_pending("m1").unwrap().unwrap();
    assert_eq!(pending.attempts, 2);
    assert_eq!(pending.last_attempt_at, Some(at));
    assert_eq!(pending.body, None);

    assert!(store.resolve_pending(&pending).unwrap());
    assert_eq!(store.pending_count().unwrap(), 0);
    assert!(!store.delete_pending("m1").unwrap());
  }

  #[test]
  fn test_user_preferences_merge() {
    let store = store();
    assert!(store.get_user_preferences("u1").unwrap().is_empty());
    assert!(!store.touch_last_sync("u1").unwrap());

    let mut patch = Map::new();
    patch.insert("theme".into(), json!("dark"));
    patch.insert("week_start".into(), json!("monday"));
    store.update_user_preferences("u1", &patch).unwrap();

    let mut patch = Map::new();
    patch.insert("theme".into(), json!("light"));
    let metadata = store.update_user_preferences("u1", &patch).unwrap();

    assert_eq!(metadata.preferences["theme"], "light");
    assert_eq!(metadata.preferences["week_start"], "monday");
    assert_eq!(store.get_user_preferences("u1").unwrap(), metadata.preferences);
    assert!(store.touch_last_sync("u1").unwrap());
  }

  #[test]
  fn test_store_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("daybook.db");

    {
      let store = LocalStore::open(&path).unwrap();
      store
        .save_task(&Task::new("t1", "u1", "Persist me"), SyncStatus::Pending)
        .unwrap();
      store
        .queue_request("task:t1:upsert", "https://api.example.com/tasks", "POST", None)
        .unwrap();
    }

    let store = LocalStore::open(&path).unwrap();
    assert_eq!(store.get_tasks("u1").unwrap().len(), 1);
    assert_eq!(store.pending_count().unwrap(), 1);
  }
}
