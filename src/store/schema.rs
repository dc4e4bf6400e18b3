/// Schema for the durable local store.
pub const SCHEMA: &str = r#"
-- Local mirror of tasks, written optimistically
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    data TEXT NOT NULL,
    sync_status TEXT NOT NULL,
    local_updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_owner ON tasks(owner_id);

-- Writes waiting to reach the backend
CREATE TABLE IF NOT EXISTS pending_requests (
    id TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    body TEXT,
    timestamp TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_attempt_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_pending_requests_timestamp ON pending_requests(timestamp);

-- One row per user, created on first preference write
CREATE TABLE IF NOT EXISTS user_sync_metadata (
    id TEXT PRIMARY KEY,
    last_sync_timestamp TEXT NOT NULL,
    preferences TEXT NOT NULL DEFAULT '{}'
);
"#;
