//! Request composer and replay.
//!
//! Sends a hand-built (or stored) request straight to its origin — the
//! proxy's listening socket is never involved — and returns the capture.
//! Nothing is persisted automatically; the caller decides whether a
//! composed exchange belongs in the store.

use crate::capture;
use crate::error::{Error, Result};
use crate::store::{
  collapse_header_map, header_map_from_pairs, unix_millis, CapturedExchange, RequestStore,
};
use http::{Method, Uri};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tapwire::{Connector, InboundResponse, Outbound};
use tokio::io::AsyncWriteExt;

/// Composed exchanges get ids from a private counter far above anything
/// SQLite will assign, so they can never collide with stored rows.
const COMPOSED_ID_BASE: i64 = 1_000_000_000;

/// Per-read timeout on composed sends.
const SEND_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// A request built by hand (or rebuilt from a stored exchange).
#[derive(Debug, Clone)]
pub struct ComposedRequest {
  /// Request method.
  pub method: String,
  /// Absolute URL.
  pub url: String,
  /// Headers as name/value pairs.
  pub headers: Vec<(String, String)>,
  /// Optional body.
  pub body: Option<Vec<u8>>,
}

/// Issues composed requests and replays stored ones.
#[derive(Clone)]
pub struct Composer {
  store: RequestStore,
  connector: Connector,
  next_id: Arc<AtomicI64>,
  max_request_body: usize,
  max_response_body: usize,
}

impl Composer {
  pub(crate) fn new(
    store: RequestStore,
    connector: Connector,
    max_request_body: usize,
    max_response_body: usize,
  ) -> Self {
    Self {
      store,
      connector,
      next_id: Arc::new(AtomicI64::new(0)),
      max_request_body,
      max_response_body,
    }
  }

  /// Send `composed` to its origin (certificate validation disabled) and
  /// return the capture. Upstream failures come back as a `502` exchange
  /// carrying the error message, mirroring the proxy path.
  pub async fn send(&self, composed: &ComposedRequest) -> Result<CapturedExchange> {
    let started = Instant::now();
    let timestamp_ms = unix_millis();
    let id = COMPOSED_ID_BASE + self.next_id.fetch_add(1, Ordering::SeqCst);

    let uri: Uri = composed.url.parse()?;
    let method = Method::from_bytes(composed.method.as_bytes())
      .map_err(|_| Error::invalid_request(format!("bad method {:?}", composed.method)))?;
    let host = uri
      .host()
      .ok_or_else(|| Error::invalid_request("composed url has no host"))?
      .to_string();
    let tls = uri.scheme() == Some(&http::uri::Scheme::HTTPS);
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
    let path = uri.path().to_string();

    let mut exchange = CapturedExchange {
      id,
      timestamp_ms,
      method: method.as_str().to_string(),
      url: composed.url.clone(),
      host: host.clone(),
      path,
      status: 0,
      request_headers: composed.headers.clone(),
      request_body: capture::stored_request_body(
        composed.body.as_deref(),
        self.max_request_body,
      ),
      response_headers: Vec::new(),
      response_body: None,
      content_type: None,
      duration_ms: 0,
      size: 0,
    };

    let result = self
      .round_trip(&method, &uri, composed, &host, port, tls)
      .await;
    exchange.duration_ms = started.elapsed().as_millis() as i64;
    match result {
      Ok((head, body)) => {
        exchange.status = head.status.as_u16();
        exchange.response_headers = collapse_header_map(&head.headers);
        exchange.response_body = capture::stored_response_body(
          &body[..body.len().min(self.max_response_body)],
          body.len() as u64,
          capture::content_encoding_of(&head.headers).as_deref(),
          self.max_response_body,
        );
        exchange.content_type = capture::content_type_of(&head.headers);
        exchange.size = body.len() as i64;
      }
      Err(e) => {
        exchange.status = 502;
        exchange.response_body = Some(e.to_string());
      }
    }
    Ok(exchange)
  }

  async fn round_trip(
    &self,
    method: &Method,
    uri: &Uri,
    composed: &ComposedRequest,
    host: &str,
    port: u16,
    tls: bool,
  ) -> Result<(tapwire::ResponseHead, Vec<u8>)> {
    let mut stream = if tls {
      self.connector.connect_tls(host, port).await?
    } else {
      self.connector.connect(host, port).await?
    };

    let mut outbound =
      Outbound::new(method.clone(), uri.clone()).headers(header_map_from_pairs(&composed.headers));
    if let Some(body) = &composed.body {
      outbound = outbound.body(body.clone());
    }
    stream.write_all(&outbound.to_raw()?).await?;
    stream.flush().await?;

    let response =
      InboundResponse::read(stream, *method == Method::HEAD, Some(SEND_READ_TIMEOUT)).await?;
    Ok(response.collect().await?)
  }

  /// Re-issue the request side of a stored exchange. The stored row is not
  /// touched; the fresh capture is returned to the caller.
  pub async fn replay(&self, id: i64) -> Result<CapturedExchange> {
    let row = self
      .store
      .get_by_id(id)?
      .ok_or_else(|| Error::Other(format!("no stored exchange with id {id}")))?;
    let composed = ComposedRequest {
      method: row.method,
      url: row.url,
      headers: row.request_headers,
      body: row.request_body.map(String::into_bytes),
    };
    self.send(&composed).await
  }
}
