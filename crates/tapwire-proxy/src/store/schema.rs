//! Schema and migrations for the traffic database.

use crate::error::Result;
use rusqlite::Connection;
use tracing::info;

/// Current schema version, tracked in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

/// Connection pragmas: WAL for concurrent readers, balanced durability.
pub fn setup_connection(conn: &Connection) -> Result<()> {
  conn.pragma_update(None, "journal_mode", "WAL")?;
  conn.pragma_update(None, "synchronous", "NORMAL")?;
  conn.pragma_update(None, "foreign_keys", "ON")?;
  conn.busy_timeout(std::time::Duration::from_secs(5))?;
  Ok(())
}

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> Result<()> {
  let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
  if version < SCHEMA_VERSION {
    info!("migrating traffic db from v{version} to v{SCHEMA_VERSION}");
    if version < 1 {
      migrate_v1(conn)?;
    }
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
  }
  Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
  conn.execute_batch(
    r#"
    CREATE TABLE IF NOT EXISTS requests (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      timestamp INTEGER NOT NULL,
      method TEXT NOT NULL,
      url TEXT NOT NULL,
      host TEXT NOT NULL,
      path TEXT NOT NULL,
      status INTEGER NOT NULL DEFAULT 0,
      request_headers TEXT NOT NULL DEFAULT '{}',
      request_body TEXT,
      response_headers TEXT NOT NULL DEFAULT '{}',
      response_body TEXT,
      content_type TEXT,
      duration INTEGER NOT NULL DEFAULT 0,
      size INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_requests_timestamp ON requests (timestamp DESC);
    CREATE INDEX IF NOT EXISTS idx_requests_host ON requests (host);
    CREATE INDEX IF NOT EXISTS idx_requests_method ON requests (method);
    CREATE INDEX IF NOT EXISTS idx_requests_status ON requests (status);
    CREATE INDEX IF NOT EXISTS idx_requests_content_type ON requests (content_type);

    CREATE TABLE IF NOT EXISTS settings (
      key TEXT PRIMARY KEY,
      value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS mock_rules (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      name TEXT NOT NULL,
      enabled INTEGER NOT NULL DEFAULT 1,
      method TEXT,
      url_pattern TEXT NOT NULL,
      response_status INTEGER NOT NULL DEFAULT 200,
      response_headers TEXT NOT NULL DEFAULT '{}',
      response_body TEXT NOT NULL DEFAULT '',
      delay INTEGER NOT NULL DEFAULT 0,
      created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    CREATE INDEX IF NOT EXISTS idx_mock_rules_enabled ON mock_rules (enabled);
    "#,
  )?;
  Ok(())
}
