//! The exchange pipeline shared by both proxy legs.
//!
//! Plain and intercepted requests converge here as an [`ExchangeRequest`]:
//! mock short-circuit, breakpoint rendezvous, pending row, upstream leg,
//! tee-capture, finalize, event. The legs differ only in how the response
//! travels back — the plaintext leg streams it chunk by chunk as it arrives,
//! the intercepted leg buffers and re-frames with a rewritten
//! `Content-Length`.
//!
//! Capture policy: the client receives the on-wire bytes untouched; a
//! separate bounded copy feeds the store, where it is decompressed and
//! UTF-8-coerced. `size` always accounts the on-wire body length.

use crate::breakpoint::Direction;
use crate::capture;
use crate::error::{Error, Result};
use crate::events::ProxyEvent;
use crate::inbound::InboundRequest;
use crate::mock::MockEngine;
use crate::proxy::ProxyEngine;
use crate::store::{collapse_header_map, header_map_from_pairs, unix_millis};
use crate::store::{PendingRequest, ResponseRecord};
use http::header::{HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Uri};
use std::time::{Duration, Instant};
use tapwire::{InboundResponse, Outbound, ResponseHead};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Per-read timeout on the origin leg.
const UPSTREAM_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// How the response is framed back to the client.
#[derive(Clone, Copy, PartialEq)]
pub(crate) enum ClientFraming {
  /// Forward the head verbatim and the body as it arrives (plaintext leg).
  Stream,
  /// Buffer the body and re-frame with a rewritten `Content-Length`
  /// (intercepted leg).
  Buffer,
}

/// A normalized request ready for the pipeline.
pub(crate) struct ExchangeRequest {
  pub method: Method,
  pub url: String,
  pub host: String,
  pub port: u16,
  pub path: String,
  /// Whether the upstream leg speaks TLS.
  pub tls: bool,
  pub headers: HeaderMap,
  pub body: Option<Vec<u8>>,
}

impl ExchangeRequest {
  /// Build from an absolute-form plaintext proxy request.
  pub(crate) fn from_plain(request: InboundRequest) -> Result<ExchangeRequest> {
    let uri: Uri = request
      .target
      .parse()
      .map_err(|_| Error::invalid_request(format!("bad request target {:?}", request.target)))?;
    let host = uri
      .host()
      .ok_or_else(|| Error::invalid_request("request target has no host"))?
      .to_string();
    let tls = uri.scheme() == Some(&http::uri::Scheme::HTTPS);
    if !tls && uri.scheme() != Some(&http::uri::Scheme::HTTP) {
      return Err(Error::invalid_request("request target must be absolute"));
    }
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
    let mut headers = request.headers;
    headers.remove("proxy-connection");
    Ok(ExchangeRequest {
      method: request.method,
      url: request.target,
      host,
      path: uri.path().to_string(),
      port,
      tls,
      headers,
      body: request.body,
    })
  }

  /// Build from a cleartext request inside an intercepted tunnel.
  pub(crate) fn from_tunnel(
    request: InboundRequest,
    host: &str,
    port: u16,
  ) -> ExchangeRequest {
    let authority = if port == 443 {
      host.to_string()
    } else {
      format!("{host}:{port}")
    };
    let (url, path) = if request.target.starts_with('/') {
      let url = format!("https://{authority}{}", request.target);
      let path = request
        .target
        .split('?')
        .next()
        .unwrap_or("/")
        .to_string();
      (url, path)
    } else {
      // Rare absolute-form target inside the tunnel; trust it.
      let path = request
        .target
        .parse::<Uri>()
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| "/".to_string());
      (request.target.clone(), path)
    };
    let mut headers = request.headers;
    headers.remove("proxy-connection");
    // The CONNECT target is authoritative on this leg; whatever Host the
    // client sent inside the tunnel is replaced with it.
    if let Ok(value) = HeaderValue::from_str(&authority) {
      headers.insert(HOST, value);
    }
    ExchangeRequest {
      method: request.method,
      url,
      host: host.to_string(),
      path,
      port,
      tls: true,
      headers,
      body: request.body,
    }
  }

  fn pending_row(&self, engine: &ProxyEngine) -> PendingRequest {
    PendingRequest {
      timestamp_ms: unix_millis(),
      method: self.method.as_str().to_string(),
      url: self.url.clone(),
      host: self.host.clone(),
      path: self.path.clone(),
      headers: collapse_header_map(&self.headers),
      body: capture::stored_request_body(
        self.body.as_deref(),
        engine.config().max_request_body_size,
      ),
    }
  }
}

/// Reason phrase for a status line.
pub(crate) fn reason_phrase(status: u16) -> &'static str {
  if status == 499 {
    return "Client Closed Request";
  }
  StatusCode::from_u16(status)
    .ok()
    .and_then(|s| s.canonical_reason())
    .unwrap_or("Unknown")
}

/// Write a small self-framed response.
pub(crate) async fn write_simple_response<W: AsyncWrite + Unpin>(
  client: &mut W,
  status: u16,
  headers: &[(String, String)],
  body: &[u8],
) -> Result<()> {
  let mut raw = format!("HTTP/1.1 {status} {}\r\n", reason_phrase(status)).into_bytes();
  for (name, value) in headers {
    let lower = name.to_ascii_lowercase();
    if lower == "content-length" || lower == "transfer-encoding" {
      continue;
    }
    raw.extend(name.as_bytes());
    raw.extend(b": ");
    raw.extend(value.as_bytes());
    raw.extend(b"\r\n");
  }
  raw.extend(format!("content-length: {}\r\n\r\n", body.len()).as_bytes());
  raw.extend(body);
  client.write_all(&raw).await?;
  client.flush().await?;
  Ok(())
}

/// Literal response for an unparseable first line.
pub(crate) async fn write_bad_request<W: AsyncWrite + Unpin>(client: &mut W) -> Result<()> {
  client
    .write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n")
    .await?;
  client.flush().await?;
  Ok(())
}

fn emit_complete(engine: &ProxyEngine, id: i64) {
  match engine.store().get_by_id(id) {
    Ok(Some(row)) => engine.events().emit(ProxyEvent::RequestComplete(row)),
    Ok(None) => {}
    Err(e) => tracing::warn!("failed to read back exchange {id}: {e}"),
  }
}

/// Finalize an exchange and emit its completion event.
fn finalize(engine: &ProxyEngine, id: i64, record: &ResponseRecord) -> Result<()> {
  if engine.store().update_response(id, record)? {
    emit_complete(engine, id);
  }
  Ok(())
}

/// Run one exchange end to end.
///
/// Returns whether the client connection can serve another request: `false`
/// when the response was close-delimited and the client needs the EOF to
/// find the body end.
pub(crate) async fn process<W>(
  engine: &ProxyEngine,
  req: ExchangeRequest,
  client: &mut W,
  framing: ClientFraming,
) -> Result<bool>
where
  W: AsyncWrite + Unpin,
{
  let start = Instant::now();
  let pending = req.pending_row(engine);

  // Mock short-circuit: a matching enabled rule means the origin never
  // sees a connection.
  if let Some(rule) = engine.mocks().find(&req.method, &req.url) {
    let mock = MockEngine::generate(&rule);
    if mock.delay_ms > 0 {
      tokio::time::sleep(Duration::from_millis(mock.delay_ms)).await;
    }
    write_simple_response(client, mock.status, &mock.headers, mock.body.as_bytes()).await?;

    let id = engine.store().save_request(&pending)?;
    let content_type = mock
      .headers
      .iter()
      .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
      .map(|(_, value)| value.split(';').next().unwrap_or(value).trim().to_string());
    finalize(
      engine,
      id,
      &ResponseRecord {
        status: mock.status,
        headers: mock.headers.clone(),
        body: (!mock.body.is_empty()).then(|| mock.body.clone()),
        content_type,
        duration_ms: start.elapsed().as_millis() as i64,
        size: mock.body.len() as i64,
      },
    )?;
    return Ok(true);
  }

  // Breakpoint, request direction. The forwarded message adopts the
  // controller's edits; the stored row keeps the original for audit.
  let mut forward_method = req.method.clone();
  let mut forward_headers = req.headers.clone();
  let mut forward_body = req.body.clone();
  if engine
    .breakpoints()
    .should_break(Direction::Request, &req.url)
  {
    let verdict = engine
      .breakpoints()
      .pause(
        Direction::Request,
        req.method.as_str().to_string(),
        req.url.clone(),
        collapse_header_map(&req.headers),
        req.body.clone(),
        None,
      )
      .await;
    match verdict {
      Ok(message) => {
        forward_method = Method::from_bytes(message.method.as_bytes())
          .unwrap_or_else(|_| req.method.clone());
        forward_headers = header_map_from_pairs(&message.headers);
        forward_headers.remove("proxy-connection");
        forward_body = message.body;
      }
      Err(Error::Dropped) => {
        let body = b"Request dropped by user";
        write_simple_response(client, 499, &[], body).await?;
        let id = engine.store().save_request(&pending)?;
        finalize(
          engine,
          id,
          &ResponseRecord {
            status: 499,
            headers: Vec::new(),
            body: Some(String::from_utf8_lossy(body).into_owned()),
            content_type: None,
            duration_ms: start.elapsed().as_millis() as i64,
            size: 0,
          },
        )?;
        return Ok(true);
      }
      Err(e) => return Err(e),
    }
  }

  let id = engine.store().save_request(&pending)?;

  // Upstream leg.
  let connect = if req.tls {
    engine.connector().connect_tls(&req.host, req.port).await
  } else {
    engine.connector().connect(&req.host, req.port).await
  };
  let mut upstream = match connect {
    Ok(stream) => stream,
    Err(e) => {
      return answer_upstream_failure(engine, client, id, &start, e.to_string(), true).await;
    }
  };

  let is_head = forward_method == Method::HEAD;
  let uri: Uri = req.url.parse()?;
  let mut outbound = Outbound::new(forward_method, uri).headers(forward_headers);
  if let Some(body) = forward_body {
    outbound = outbound.body(body);
  }
  let raw = outbound.to_raw()?;
  if let Err(e) = write_upstream(&mut upstream, &raw).await {
    return answer_upstream_failure(engine, client, id, &start, e.to_string(), true).await;
  }

  let response =
    match InboundResponse::read(upstream, is_head, Some(UPSTREAM_READ_TIMEOUT)).await {
      Ok(response) => response,
      Err(e) => {
        return answer_upstream_failure(engine, client, id, &start, e.to_string(), true).await;
      }
    };

  // Breakpoint, response direction. Pausing implies buffering: the verdict
  // may rewrite the message wholesale.
  if engine
    .breakpoints()
    .should_break(Direction::Response, &req.url)
  {
    let (head, body) = match response.collect().await {
      Ok(parts) => parts,
      Err(e) => {
        return answer_upstream_failure(engine, client, id, &start, e.to_string(), true).await;
      }
    };
    let verdict = engine
      .breakpoints()
      .pause(
        Direction::Response,
        req.method.as_str().to_string(),
        req.url.clone(),
        collapse_header_map(&head.headers),
        Some(body.clone()),
        Some(head.status.as_u16()),
      )
      .await;
    return match verdict {
      Ok(message) => {
        let status = message.status.unwrap_or_else(|| head.status.as_u16());
        let reply_body = message.body.unwrap_or_default();
        write_simple_response(client, status, &message.headers, &reply_body).await?;
        // The store keeps the origin's original response.
        finalize_body(engine, id, &start, &head, &body, body.len() as u64)?;
        Ok(true)
      }
      Err(Error::Dropped) => {
        let reply = b"Request dropped by user";
        write_simple_response(client, 499, &[], reply).await?;
        finalize(
          engine,
          id,
          &ResponseRecord {
            status: 499,
            headers: Vec::new(),
            body: Some(String::from_utf8_lossy(reply).into_owned()),
            content_type: None,
            duration_ms: start.elapsed().as_millis() as i64,
            size: 0,
          },
        )?;
        Ok(true)
      }
      Err(e) => Err(e),
    };
  }

  match framing {
    ClientFraming::Buffer => {
      let (head, body) = match response.collect().await {
        Ok(parts) => parts,
        Err(e) => {
          return answer_upstream_failure(engine, client, id, &start, e.to_string(), true)
            .await;
        }
      };
      write_buffered_response(client, &head, &body).await?;
      finalize_body(engine, id, &start, &head, &body, body.len() as u64)?;
      Ok(true)
    }
    ClientFraming::Stream => stream_response(engine, client, id, &start, response).await,
  }
}

async fn write_upstream(
  upstream: &mut tapwire::Stream,
  raw: &[u8],
) -> std::result::Result<(), tapwire::Error> {
  upstream.write_all(raw).await?;
  upstream.flush().await?;
  Ok(())
}

/// Forward the head verbatim, then pipe payload chunks as they arrive while
/// capturing a bounded copy. Chunked origin responses are re-emitted as
/// chunked so streaming never needs the total length.
async fn stream_response<W>(
  engine: &ProxyEngine,
  client: &mut W,
  id: i64,
  start: &Instant,
  mut response: InboundResponse<tapwire::Stream>,
) -> Result<bool>
where
  W: AsyncWrite + Unpin,
{
  let head = response.head().clone();
  let chunked = head.is_chunked();
  let cap = engine.config().max_response_body_size;
  // Close-delimited bodies need the EOF to end; the client connection
  // cannot be reused afterwards.
  let reusable = chunked
    || head.content_length().is_some()
    || head.status.is_informational()
    || head.status == StatusCode::NO_CONTENT
    || head.status == StatusCode::NOT_MODIFIED;

  client.write_all(&head.to_raw()).await?;

  let mut captured: Vec<u8> = Vec::new();
  let mut wire_len: u64 = 0;
  loop {
    match response.next_chunk().await {
      Ok(Some(chunk)) => {
        if chunked {
          client
            .write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
            .await?;
          client.write_all(&chunk).await?;
          client.write_all(b"\r\n").await?;
        } else {
          client.write_all(&chunk).await?;
        }
        wire_len += chunk.len() as u64;
        let room = cap.saturating_sub(captured.len());
        if room > 0 {
          captured.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
      }
      Ok(None) => {
        if chunked {
          client.write_all(b"0\r\n\r\n").await?;
        }
        break;
      }
      Err(e) => {
        // Headers already went out; all we can do is record the failure
        // and drop the connection.
        let _ = finalize(
          engine,
          id,
          &ResponseRecord {
            status: 502,
            headers: Vec::new(),
            body: Some(e.to_string()),
            content_type: None,
            duration_ms: start.elapsed().as_millis() as i64,
            size: wire_len as i64,
          },
        );
        return Err(Error::upstream(e.to_string()));
      }
    }
  }
  client.flush().await?;

  finalize_streamed(engine, id, start, &head, &captured, wire_len)?;
  Ok(reusable)
}

fn finalize_streamed(
  engine: &ProxyEngine,
  id: i64,
  start: &Instant,
  head: &ResponseHead,
  captured: &[u8],
  wire_len: u64,
) -> Result<()> {
  let record = ResponseRecord {
    status: head.status.as_u16(),
    headers: collapse_header_map(&head.headers),
    body: capture::stored_response_body(
      captured,
      wire_len,
      capture::content_encoding_of(&head.headers).as_deref(),
      engine.config().max_response_body_size,
    ),
    content_type: capture::content_type_of(&head.headers),
    duration_ms: start.elapsed().as_millis() as i64,
    size: wire_len as i64,
  };
  finalize(engine, id, &record)
}

fn finalize_body(
  engine: &ProxyEngine,
  id: i64,
  start: &Instant,
  head: &ResponseHead,
  body: &[u8],
  wire_len: u64,
) -> Result<()> {
  let cap = engine.config().max_response_body_size;
  let captured = &body[..body.len().min(cap)];
  finalize_streamed(engine, id, start, head, captured, wire_len)
}

/// Record a 502 and answer the client when the head has not been sent yet.
async fn answer_upstream_failure<W>(
  engine: &ProxyEngine,
  client: &mut W,
  id: i64,
  start: &Instant,
  message: String,
  headers_unsent: bool,
) -> Result<bool>
where
  W: AsyncWrite + Unpin,
{
  tracing::debug!("upstream failure for exchange {id}: {message}");
  finalize(
    engine,
    id,
    &ResponseRecord {
      status: 502,
      headers: Vec::new(),
      body: Some(message.clone()),
      content_type: None,
      duration_ms: start.elapsed().as_millis() as i64,
      size: 0,
    },
  )?;
  if headers_unsent {
    write_simple_response(client, 502, &[], message.as_bytes()).await?;
  }
  Ok(true)
}

/// Re-frame a buffered response: head minus `Transfer-Encoding`, rewritten
/// `Content-Length`, then the body bytes.
async fn write_buffered_response<W>(
  client: &mut W,
  head: &ResponseHead,
  body: &[u8],
) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let mut raw = Vec::with_capacity(256 + body.len());
  raw.extend(format!("{:?}", head.version).as_bytes());
  raw.push(b' ');
  raw.extend(head.status.as_u16().to_string().as_bytes());
  raw.push(b' ');
  raw.extend(reason_phrase(head.status.as_u16()).as_bytes());
  raw.extend(b"\r\n");
  for (name, value) in head.headers.iter() {
    if name == TRANSFER_ENCODING || name == CONTENT_LENGTH {
      continue;
    }
    raw.extend(name.as_str().as_bytes());
    raw.extend(b": ");
    raw.extend(value.as_bytes());
    raw.extend(b"\r\n");
  }
  raw.extend(format!("content-length: {}\r\n\r\n", body.len()).as_bytes());
  raw.extend(body);
  client.write_all(&raw).await?;
  client.flush().await?;
  Ok(())
}

/// Splice a WebSocket upgrade: forward the handshake, record one row, then
/// pipe both directions without frame inspection.
pub(crate) async fn handle_upgrade<C>(
  engine: &ProxyEngine,
  req: ExchangeRequest,
  client: &mut C,
) -> Result<bool>
where
  C: AsyncRead + AsyncWrite + Unpin,
{
  let start = Instant::now();
  let pending = PendingRequest {
    timestamp_ms: unix_millis(),
    method: "WEBSOCKET".to_string(),
    url: req.url.clone(),
    host: req.host.clone(),
    path: req.path.clone(),
    headers: collapse_header_map(&req.headers),
    body: None,
  };
  let id = engine.store().save_request(&pending)?;

  let connect = if req.tls {
    engine.connector().connect_tls(&req.host, req.port).await
  } else {
    engine.connector().connect(&req.host, req.port).await
  };
  let mut upstream = match connect {
    Ok(stream) => stream,
    Err(e) => {
      return answer_upstream_failure(engine, client, id, &start, e.to_string(), true).await;
    }
  };

  let uri: Uri = req.url.parse()?;
  let outbound = Outbound::new(req.method.clone(), uri).headers(req.headers.clone());
  let raw = outbound.to_raw()?;
  if let Err(e) = write_upstream(&mut upstream, &raw).await {
    return answer_upstream_failure(engine, client, id, &start, e.to_string(), true).await;
  }

  let response = match InboundResponse::read(upstream, false, Some(UPSTREAM_READ_TIMEOUT)).await
  {
    Ok(response) => response,
    Err(e) => {
      return answer_upstream_failure(engine, client, id, &start, e.to_string(), true).await;
    }
  };

  if response.head().status == StatusCode::SWITCHING_PROTOCOLS {
    let (head, mut upstream) = response.into_parts();
    client.write_all(&head.to_raw()).await?;
    client.flush().await?;
    finalize(
      engine,
      id,
      &ResponseRecord {
        status: 101,
        headers: collapse_header_map(&head.headers),
        body: None,
        content_type: None,
        duration_ms: start.elapsed().as_millis() as i64,
        size: 0,
      },
    )?;
    let _ = tokio::io::copy_bidirectional(client, &mut upstream).await;
    return Ok(false);
  }

  // Origin refused the upgrade; fall back to an ordinary buffered reply.
  let (head, body) = match response.collect().await {
    Ok(parts) => parts,
    Err(e) => {
      return answer_upstream_failure(engine, client, id, &start, e.to_string(), true).await;
    }
  };
  write_buffered_response(client, &head, &body).await?;
  finalize_body(engine, id, &start, &head, &body, body.len() as u64)?;
  Ok(true)
}

#[cfg(test)]
mod tests {
  use super::*;
  use http::header::HeaderValue;
  use http::Version;

  #[test]
  fn reason_phrases_cover_the_synthesized_statuses() {
    assert_eq!(reason_phrase(400), "Bad Request");
    assert_eq!(reason_phrase(499), "Client Closed Request");
    assert_eq!(reason_phrase(502), "Bad Gateway");
    assert_eq!(reason_phrase(999), "Unknown");
  }

  #[test]
  fn plain_requests_require_absolute_targets() {
    let request = InboundRequest {
      method: Method::GET,
      target: "/relative".into(),
      version: Version::HTTP_11,
      headers: HeaderMap::new(),
      body: None,
    };
    assert!(ExchangeRequest::from_plain(request).is_err());
  }

  #[test]
  fn plain_requests_derive_upstream_from_target() {
    let request = InboundRequest {
      method: Method::GET,
      target: "http://example.test:8080/hi?q=1".into(),
      version: Version::HTTP_11,
      headers: HeaderMap::new(),
      body: None,
    };
    let exchange = ExchangeRequest::from_plain(request).unwrap();
    assert_eq!(exchange.host, "example.test");
    assert_eq!(exchange.port, 8080);
    assert_eq!(exchange.path, "/hi");
    assert!(!exchange.tls);
  }

  #[test]
  fn tunnel_requests_synthesize_https_urls() {
    let request = InboundRequest {
      method: Method::GET,
      target: "/x".into(),
      version: Version::HTTP_11,
      headers: HeaderMap::new(),
      body: None,
    };
    let exchange = ExchangeRequest::from_tunnel(request, "secure.test", 443);
    assert_eq!(exchange.url, "https://secure.test/x");
    assert_eq!(exchange.path, "/x");
    assert!(exchange.tls);

    let request = InboundRequest {
      method: Method::GET,
      target: "/y?q=1".into(),
      version: Version::HTTP_11,
      headers: HeaderMap::new(),
      body: None,
    };
    let exchange = ExchangeRequest::from_tunnel(request, "secure.test", 8443);
    assert_eq!(exchange.url, "https://secure.test:8443/y?q=1");
    assert_eq!(exchange.path, "/y");
  }

  #[test]
  fn tunnel_requests_force_the_connect_host() {
    let mut headers = HeaderMap::new();
    headers.insert("host", HeaderValue::from_static("spoofed.test"));
    let request = InboundRequest {
      method: Method::GET,
      target: "/x".into(),
      version: Version::HTTP_11,
      headers,
      body: None,
    };
    let exchange = ExchangeRequest::from_tunnel(request, "secure.test", 443);
    assert_eq!(exchange.headers.get("host").unwrap(), "secure.test");

    // Non-default ports keep the port in the forced header.
    let mut headers = HeaderMap::new();
    headers.insert("host", HeaderValue::from_static("spoofed.test"));
    let request = InboundRequest {
      method: Method::GET,
      target: "/x".into(),
      version: Version::HTTP_11,
      headers,
      body: None,
    };
    let exchange = ExchangeRequest::from_tunnel(request, "secure.test", 8443);
    assert_eq!(exchange.headers.get("host").unwrap(), "secure.test:8443");

    // A tunnel request without a Host header gets one anyway.
    let request = InboundRequest {
      method: Method::GET,
      target: "/x".into(),
      version: Version::HTTP_11,
      headers: HeaderMap::new(),
      body: None,
    };
    let exchange = ExchangeRequest::from_tunnel(request, "secure.test", 443);
    assert_eq!(exchange.headers.get("host").unwrap(), "secure.test");
  }

  #[test]
  fn proxy_connection_header_is_stripped() {
    let mut headers = HeaderMap::new();
    headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
    let request = InboundRequest {
      method: Method::GET,
      target: "http://a.test/".into(),
      version: Version::HTTP_11,
      headers,
      body: None,
    };
    let exchange = ExchangeRequest::from_plain(request).unwrap();
    assert!(!exchange.headers.contains_key("proxy-connection"));
  }
}
