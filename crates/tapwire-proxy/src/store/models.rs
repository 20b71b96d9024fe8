//! Store row types and the header column codec.

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// One observed request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedExchange {
  /// Row id, monotonic within the store.
  pub id: i64,
  /// Wall-clock milliseconds when the request line arrived.
  pub timestamp_ms: i64,
  /// Request method (`WEBSOCKET` for spliced upgrades).
  pub method: String,
  /// Absolute URL as sent (plain) or synthesized (`https://host/path`).
  pub url: String,
  /// Target host.
  pub host: String,
  /// Request path.
  pub path: String,
  /// 0 while pending; final status once recorded. `502` marks upstream
  /// failure, `499` a user drop at a breakpoint.
  pub status: u16,
  /// Request headers, lowercase names, multi-values comma-joined.
  pub request_headers: Vec<(String, String)>,
  /// Stored request body, or a policy placeholder.
  pub request_body: Option<String>,
  /// Response headers, lowercase names, multi-values comma-joined.
  pub response_headers: Vec<(String, String)>,
  /// Stored response body (decompressed), or a policy placeholder.
  pub response_body: Option<String>,
  /// Response content type, first `;`-separated token.
  pub content_type: Option<String>,
  /// Milliseconds from request receipt to response end.
  pub duration_ms: i64,
  /// On-wire response body length (still compressed if the origin
  /// compressed it).
  pub size: i64,
}

/// Insert form of an exchange; everything known before the upstream call.
#[derive(Debug, Clone)]
pub struct PendingRequest {
  /// Wall-clock milliseconds of request receipt.
  pub timestamp_ms: i64,
  /// Request method.
  pub method: String,
  /// Absolute URL.
  pub url: String,
  /// Target host.
  pub host: String,
  /// Request path.
  pub path: String,
  /// Request headers.
  pub headers: Vec<(String, String)>,
  /// Stored request body (already policy-coerced).
  pub body: Option<String>,
}

/// Finalize form of an exchange.
#[derive(Debug, Clone)]
pub struct ResponseRecord {
  /// Final status code.
  pub status: u16,
  /// Response headers.
  pub headers: Vec<(String, String)>,
  /// Stored response body (already policy-coerced).
  pub body: Option<String>,
  /// Content type, first `;`-separated token.
  pub content_type: Option<String>,
  /// Exchange duration in milliseconds.
  pub duration_ms: i64,
  /// On-wire response body length.
  pub size: i64,
}

/// A persisted mock rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockRule {
  /// Rule id.
  pub id: i64,
  /// Display name.
  pub name: String,
  /// Disabled rules never match.
  pub enabled: bool,
  /// Optional method filter; unfiltered when absent.
  pub method: Option<String>,
  /// Case-insensitive regex matched against the full URL.
  pub url_pattern: String,
  /// Synthesized status code.
  pub response_status: u16,
  /// Synthesized headers.
  pub response_headers: Vec<(String, String)>,
  /// Synthesized body, literal.
  pub response_body: String,
  /// Artificial delay before answering.
  pub delay_ms: u64,
  /// Creation timestamp, as recorded by the store.
  pub created_at: String,
}

/// Insert/update form of a mock rule.
#[derive(Debug, Clone, Default)]
pub struct NewMockRule {
  /// Display name.
  pub name: String,
  /// Whether the rule participates in matching.
  pub enabled: bool,
  /// Optional method filter.
  pub method: Option<String>,
  /// Case-insensitive regex matched against the full URL.
  pub url_pattern: String,
  /// Synthesized status code.
  pub response_status: u16,
  /// Synthesized headers.
  pub response_headers: Vec<(String, String)>,
  /// Synthesized body.
  pub response_body: String,
  /// Artificial delay before answering.
  pub delay_ms: u64,
}

/// Query filter for [`RequestStore::list`](crate::RequestStore::list) and
/// [`count`](crate::RequestStore::count).
///
/// All populated fields are ANDed. `status_codes` entries are literal status
/// values; expanding UI buckets like `"2xx"` is the caller's concern.
#[derive(Debug, Clone, Default)]
pub struct TrafficFilter {
  /// Case-insensitive substring match over url, host and path.
  pub search_query: Option<String>,
  /// Exact method matches.
  pub methods: Vec<String>,
  /// Exact status matches.
  pub status_codes: Vec<u16>,
  /// Exact host matches.
  pub hosts: Vec<String>,
  /// Substring matches over content type.
  pub content_types: Vec<String>,
  /// Inclusive `(start_ms, end_ms)` bounds on the exchange timestamp.
  pub date_range: Option<(i64, i64)>,
  /// Page size.
  pub limit: Option<u32>,
  /// Page offset.
  pub offset: Option<u32>,
}

/// Current wall clock in unix milliseconds.
pub(crate) fn unix_millis() -> i64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as i64)
    .unwrap_or(0)
}

/// Collapse a header map into stored form: lowercase names in wire order,
/// repeated names joined with `", "`, values lossily decoded.
pub fn collapse_header_map(map: &HeaderMap) -> Vec<(String, String)> {
  let mut pairs: Vec<(String, String)> = Vec::with_capacity(map.len());
  for (name, value) in map.iter() {
    let name = name.as_str().to_string();
    let value = String::from_utf8_lossy(value.as_bytes()).to_string();
    match pairs.iter_mut().find(|(n, _)| *n == name) {
      Some((_, existing)) => {
        existing.push_str(", ");
        existing.push_str(&value);
      }
      None => pairs.push((name, value)),
    }
  }
  pairs
}

/// Rebuild a typed header map from stored pairs. Pairs that no longer parse
/// as header names or values are skipped.
pub(crate) fn header_map_from_pairs(pairs: &[(String, String)]) -> HeaderMap {
  let mut map = HeaderMap::new();
  for (name, value) in pairs {
    if let (Ok(name), Ok(value)) = (
      http::header::HeaderName::from_bytes(name.as_bytes()),
      http::header::HeaderValue::from_str(value),
    ) {
      map.append(name, value);
    }
  }
  map
}

/// Encode header pairs as a JSON object, preserving order.
pub fn headers_to_json(pairs: &[(String, String)]) -> String {
  let mut map = serde_json::Map::with_capacity(pairs.len());
  for (name, value) in pairs {
    map.insert(name.clone(), serde_json::Value::String(value.clone()));
  }
  serde_json::Value::Object(map).to_string()
}

/// Decode a stored header column. Malformed JSON degrades to empty, never
/// errors.
pub fn headers_from_json(raw: &str) -> Vec<(String, String)> {
  match serde_json::from_str::<serde_json::Value>(raw) {
    Ok(serde_json::Value::Object(map)) => map
      .into_iter()
      .map(|(name, value)| {
        let value = match value {
          serde_json::Value::String(s) => s,
          other => other.to_string(),
        };
        (name, value)
      })
      .collect(),
    _ => Vec::new(),
  }
}
