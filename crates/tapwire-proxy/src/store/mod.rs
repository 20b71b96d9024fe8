//! Durable request store.
//!
//! A single SQLite file under `<data_dir>/data/traffic.db` holds every
//! captured exchange, the mock rules and opaque settings. Writes are
//! serialized through one connection guarded by a mutex; WAL journaling
//! keeps concurrent readers cheap. Exchange rows are written twice and only
//! twice: once pending (`status = 0`) and once final — finalization is gated
//! on `status = 0` at the SQL level so a final row can never be rewritten.

mod models;
mod schema;

pub use models::{
  collapse_header_map, headers_from_json, headers_to_json, CapturedExchange, MockRule,
  NewMockRule, PendingRequest, ResponseRecord, TrafficFilter,
};
pub(crate) use models::{header_map_from_pairs, unix_millis};

use crate::error::Result;
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const EXCHANGE_COLUMNS: &str = "id, timestamp, method, url, host, path, status, \
  request_headers, request_body, response_headers, response_body, content_type, duration, size";

const MOCK_COLUMNS: &str =
  "id, name, enabled, method, url_pattern, response_status, response_headers, response_body, \
  delay, created_at";

/// Handle to the traffic database. Cheap to clone.
#[derive(Clone)]
pub struct RequestStore {
  conn: Arc<Mutex<Connection>>,
}

impl RequestStore {
  /// Open (or create) the store under `data_dir`.
  pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
    let dir = data_dir.as_ref().join("data");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("traffic.db");
    info!("opening traffic db at {:?}", path);
    Self::from_connection(Connection::open(path)?)
  }

  /// In-memory store for tests.
  pub fn in_memory() -> Result<Self> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    schema::setup_connection(&conn)?;
    schema::run_migrations(&conn)?;
    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  // === Exchanges ===

  /// Insert a pending row (`status = 0`) and return its id.
  pub fn save_request(&self, pending: &PendingRequest) -> Result<i64> {
    let conn = self.conn.lock();
    conn.execute(
      "INSERT INTO requests (timestamp, method, url, host, path, status, request_headers, request_body)
       VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7)",
      params![
        pending.timestamp_ms,
        pending.method,
        pending.url,
        pending.host,
        pending.path,
        headers_to_json(&pending.headers),
        pending.body,
      ],
    )?;
    Ok(conn.last_insert_rowid())
  }

  /// Finalize a pending row. Returns `false` when the row does not exist or
  /// was already finalized; final rows are never rewritten.
  pub fn update_response(&self, id: i64, record: &ResponseRecord) -> Result<bool> {
    let conn = self.conn.lock();
    let changed = conn.execute(
      "UPDATE requests
       SET status = ?2, response_headers = ?3, response_body = ?4, content_type = ?5,
           duration = ?6, size = ?7
       WHERE id = ?1 AND status = 0",
      params![
        id,
        record.status,
        headers_to_json(&record.headers),
        record.body,
        record.content_type,
        record.duration_ms,
        record.size,
      ],
    )?;
    Ok(changed > 0)
  }

  /// Fetch one exchange.
  pub fn get_by_id(&self, id: i64) -> Result<Option<CapturedExchange>> {
    let conn = self.conn.lock();
    let row = conn
      .query_row(
        &format!("SELECT {EXCHANGE_COLUMNS} FROM requests WHERE id = ?1"),
        params![id],
        map_exchange,
      )
      .optional()?;
    Ok(row)
  }

  /// List exchanges matching `filter`, newest first (ties broken by id,
  /// also descending).
  pub fn list(&self, filter: &TrafficFilter) -> Result<Vec<CapturedExchange>> {
    let (clause, mut values) = filter_clause(filter);
    let mut sql =
      format!("SELECT {EXCHANGE_COLUMNS} FROM requests{clause} ORDER BY timestamp DESC, id DESC");
    if filter.limit.is_some() || filter.offset.is_some() {
      sql.push_str(" LIMIT ? OFFSET ?");
      values.push(Value::Integer(filter.limit.map(i64::from).unwrap_or(-1)));
      values.push(Value::Integer(filter.offset.map(i64::from).unwrap_or(0)));
    }

    let conn = self.conn.lock();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), map_exchange)?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
  }

  /// Count exchanges matching `filter`, ignoring pagination.
  pub fn count(&self, filter: &TrafficFilter) -> Result<u64> {
    let (clause, values) = filter_clause(filter);
    let conn = self.conn.lock();
    let count: i64 = conn.query_row(
      &format!("SELECT COUNT(*) FROM requests{clause}"),
      params_from_iter(values),
      |row| row.get(0),
    )?;
    Ok(count as u64)
  }

  /// Distinct hosts seen so far.
  pub fn unique_hosts(&self) -> Result<Vec<String>> {
    self.distinct_column("host")
  }

  /// Distinct methods seen so far.
  pub fn unique_methods(&self) -> Result<Vec<String>> {
    self.distinct_column("method")
  }

  /// Distinct content types seen so far.
  pub fn unique_content_types(&self) -> Result<Vec<String>> {
    self.distinct_column("content_type")
  }

  fn distinct_column(&self, column: &str) -> Result<Vec<String>> {
    let conn = self.conn.lock();
    let mut stmt = conn.prepare(&format!(
      "SELECT DISTINCT {column} FROM requests WHERE {column} IS NOT NULL AND {column} != '' ORDER BY {column}"
    ))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
  }

  /// Delete one exchange.
  pub fn delete(&self, id: i64) -> Result<bool> {
    let conn = self.conn.lock();
    Ok(conn.execute("DELETE FROM requests WHERE id = ?1", params![id])? > 0)
  }

  /// Delete every exchange and reclaim file space.
  pub fn clear_all(&self) -> Result<()> {
    let conn = self.conn.lock();
    conn.execute("DELETE FROM requests", [])?;
    conn.execute_batch("VACUUM")?;
    Ok(())
  }

  /// Delete exchanges older than `hours`. Returns how many went.
  pub fn delete_older_than(&self, hours: u64) -> Result<usize> {
    let cutoff = unix_millis() - (hours as i64) * 3_600_000;
    let conn = self.conn.lock();
    Ok(conn.execute("DELETE FROM requests WHERE timestamp < ?1", params![cutoff])?)
  }

  // === Settings ===

  /// Read an opaque setting.
  pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
    let conn = self.conn.lock();
    let value = conn
      .query_row(
        "SELECT value FROM settings WHERE key = ?1",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  /// Write an opaque setting.
  pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.conn.lock();
    conn.execute(
      "INSERT INTO settings (key, value) VALUES (?1, ?2)
       ON CONFLICT (key) DO UPDATE SET value = excluded.value",
      params![key, value],
    )?;
    Ok(())
  }

  // === Mock rules ===

  /// Persist a new rule and return it with its assigned id.
  pub fn insert_mock_rule(&self, rule: &NewMockRule) -> Result<MockRule> {
    let id = {
      let conn = self.conn.lock();
      conn.execute(
        "INSERT INTO mock_rules (name, enabled, method, url_pattern, response_status,
           response_headers, response_body, delay)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
          rule.name,
          rule.enabled,
          rule.method,
          rule.url_pattern,
          rule.response_status,
          headers_to_json(&rule.response_headers),
          rule.response_body,
          rule.delay_ms as i64,
        ],
      )?;
      conn.last_insert_rowid()
    };
    match self.get_mock_rule(id)? {
      Some(rule) => Ok(rule),
      None => Err(rusqlite::Error::QueryReturnedNoRows.into()),
    }
  }

  /// Fetch one rule.
  pub fn get_mock_rule(&self, id: i64) -> Result<Option<MockRule>> {
    let conn = self.conn.lock();
    let rule = conn
      .query_row(
        &format!("SELECT {MOCK_COLUMNS} FROM mock_rules WHERE id = ?1"),
        params![id],
        map_mock_rule,
      )
      .optional()?;
    Ok(rule)
  }

  /// All rules, newest creation first. This listing order is the match
  /// precedence order.
  pub fn list_mock_rules(&self) -> Result<Vec<MockRule>> {
    let conn = self.conn.lock();
    let mut stmt = conn.prepare(&format!(
      "SELECT {MOCK_COLUMNS} FROM mock_rules ORDER BY created_at DESC, id DESC"
    ))?;
    let rows = stmt.query_map([], map_mock_rule)?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
  }

  /// Replace a rule's fields.
  pub fn update_mock_rule(&self, id: i64, rule: &NewMockRule) -> Result<bool> {
    let conn = self.conn.lock();
    let changed = conn.execute(
      "UPDATE mock_rules
       SET name = ?2, enabled = ?3, method = ?4, url_pattern = ?5, response_status = ?6,
           response_headers = ?7, response_body = ?8, delay = ?9
       WHERE id = ?1",
      params![
        id,
        rule.name,
        rule.enabled,
        rule.method,
        rule.url_pattern,
        rule.response_status,
        headers_to_json(&rule.response_headers),
        rule.response_body,
        rule.delay_ms as i64,
      ],
    )?;
    Ok(changed > 0)
  }

  /// Flip a rule's enabled flag.
  pub fn set_mock_rule_enabled(&self, id: i64, enabled: bool) -> Result<bool> {
    let conn = self.conn.lock();
    let changed = conn.execute(
      "UPDATE mock_rules SET enabled = ?2 WHERE id = ?1",
      params![id, enabled],
    )?;
    Ok(changed > 0)
  }

  /// Delete a rule.
  pub fn delete_mock_rule(&self, id: i64) -> Result<bool> {
    let conn = self.conn.lock();
    Ok(conn.execute("DELETE FROM mock_rules WHERE id = ?1", params![id])? > 0)
  }
}

fn map_exchange(row: &Row<'_>) -> rusqlite::Result<CapturedExchange> {
  Ok(CapturedExchange {
    id: row.get(0)?,
    timestamp_ms: row.get(1)?,
    method: row.get(2)?,
    url: row.get(3)?,
    host: row.get(4)?,
    path: row.get(5)?,
    status: row.get::<_, i64>(6)? as u16,
    request_headers: headers_from_json(&row.get::<_, String>(7)?),
    request_body: row.get(8)?,
    response_headers: headers_from_json(&row.get::<_, String>(9)?),
    response_body: row.get(10)?,
    content_type: row.get(11)?,
    duration_ms: row.get(12)?,
    size: row.get(13)?,
  })
}

fn map_mock_rule(row: &Row<'_>) -> rusqlite::Result<MockRule> {
  Ok(MockRule {
    id: row.get(0)?,
    name: row.get(1)?,
    enabled: row.get(2)?,
    method: row.get(3)?,
    url_pattern: row.get(4)?,
    response_status: row.get::<_, i64>(5)? as u16,
    response_headers: headers_from_json(&row.get::<_, String>(6)?),
    response_body: row.get(7)?,
    delay_ms: row.get::<_, i64>(8)? as u64,
    created_at: row.get(9)?,
  })
}

fn filter_clause(filter: &TrafficFilter) -> (String, Vec<Value>) {
  let mut conditions: Vec<String> = Vec::new();
  let mut values: Vec<Value> = Vec::new();

  if let Some(query) = filter.search_query.as_deref().filter(|q| !q.is_empty()) {
    let like = format!("%{query}%");
    conditions.push("(url LIKE ? OR host LIKE ? OR path LIKE ?)".to_string());
    values.push(Value::Text(like.clone()));
    values.push(Value::Text(like.clone()));
    values.push(Value::Text(like));
  }
  if !filter.methods.is_empty() {
    conditions.push(format!("method IN ({})", placeholders(filter.methods.len())));
    values.extend(filter.methods.iter().cloned().map(Value::Text));
  }
  if !filter.status_codes.is_empty() {
    conditions.push(format!(
      "status IN ({})",
      placeholders(filter.status_codes.len())
    ));
    values.extend(
      filter
        .status_codes
        .iter()
        .map(|s| Value::Integer(i64::from(*s))),
    );
  }
  if !filter.hosts.is_empty() {
    conditions.push(format!("host IN ({})", placeholders(filter.hosts.len())));
    values.extend(filter.hosts.iter().cloned().map(Value::Text));
  }
  if !filter.content_types.is_empty() {
    let likes = vec!["content_type LIKE ?"; filter.content_types.len()].join(" OR ");
    conditions.push(format!("({likes})"));
    values.extend(
      filter
        .content_types
        .iter()
        .map(|t| Value::Text(format!("%{t}%"))),
    );
  }
  if let Some((start, end)) = filter.date_range {
    conditions.push("timestamp BETWEEN ? AND ?".to_string());
    values.push(Value::Integer(start));
    values.push(Value::Integer(end));
  }

  if conditions.is_empty() {
    (String::new(), values)
  } else {
    (format!(" WHERE {}", conditions.join(" AND ")), values)
  }
}

fn placeholders(n: usize) -> String {
  vec!["?"; n].join(", ")
}
