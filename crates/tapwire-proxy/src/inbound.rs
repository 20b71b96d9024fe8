//! Client-side request reading.
//!
//! Parses HTTP/1.x requests off client sockets: the plaintext proxy leg and
//! the cleartext inside intercepted TLS tunnels both come through here.
//! Header names arrive lowercased (the `http` types normalize them), values
//! stay verbatim. Bodies are buffered fully — `Content-Length` framed or
//! chunked — because mocks, breakpoints and the store all want the whole
//! message.

use crate::error::{Error, Result};
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING, UPGRADE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Version};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio::time::timeout;

/// How long a kept-alive connection may sit idle between requests.
pub(crate) const KEEP_ALIVE_IDLE: Duration = Duration::from_secs(60);
/// Allowed time for reading a request head once its first byte arrived.
pub(crate) const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(65);

const MAX_REQUEST_LINE: usize = 8 * 1024;
const MAX_HEADER_BLOCK: usize = 64 * 1024;

/// A fully buffered client request.
#[derive(Debug)]
pub(crate) struct InboundRequest {
  pub method: Method,
  /// Raw request-target exactly as the client sent it.
  pub target: String,
  pub version: Version,
  pub headers: HeaderMap,
  pub body: Option<Vec<u8>>,
}

async fn timed<T, F>(limit: Duration, fut: F) -> Result<T>
where
  F: Future<Output = std::io::Result<T>>,
{
  match timeout(limit, fut).await {
    Ok(result) => result.map_err(Error::Io),
    Err(_) => Err(Error::Io(std::io::Error::new(
      std::io::ErrorKind::TimedOut,
      "client read timed out",
    ))),
  }
}

/// Read the next request line, waiting out the keep-alive idle window.
///
/// `Ok(None)` means the client closed cleanly or went idle past the window;
/// the connection should be dropped without noise.
pub(crate) async fn read_request_line<R>(reader: &mut R) -> Result<Option<String>>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  let n = match timeout(KEEP_ALIVE_IDLE, reader.read_until(b'\n', &mut line)).await {
    Ok(result) => result.map_err(Error::Io)?,
    Err(_) => return Ok(None),
  };
  if n == 0 {
    return Ok(None);
  }
  if line.len() > MAX_REQUEST_LINE {
    return Err(Error::invalid_request("request line too long"));
  }
  Ok(Some(String::from_utf8_lossy(&line).trim_end().to_string()))
}

/// Parse `METHOD target HTTP/x.y`.
pub(crate) fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
  let mut parts = line.split_whitespace();
  let method = parts
    .next()
    .and_then(|m| m.parse::<Method>().ok())
    .ok_or_else(|| Error::invalid_request(format!("bad method in {line:?}")))?;
  let target = parts
    .next()
    .ok_or_else(|| Error::invalid_request(format!("missing target in {line:?}")))?
    .to_string();
  let version = match parts.next() {
    Some("HTTP/1.1") | None => Version::HTTP_11,
    Some("HTTP/1.0") => Version::HTTP_10,
    Some(other) => {
      return Err(Error::invalid_request(format!(
        "unsupported version {other:?}"
      )));
    }
  };
  Ok((method, target, version))
}

/// Read headers and body for a request whose first line is already parsed.
pub(crate) async fn finish_request<R>(
  reader: &mut R,
  method: Method,
  target: String,
  version: Version,
) -> Result<InboundRequest>
where
  R: AsyncBufRead + Unpin,
{
  let headers = read_headers(reader).await?;
  let body = read_body(reader, &headers).await?;
  Ok(InboundRequest {
    method,
    target,
    version,
    headers,
    body,
  })
}

/// Read one complete request, or `None` on clean close / idle expiry.
pub(crate) async fn read_request<R>(reader: &mut R) -> Result<Option<InboundRequest>>
where
  R: AsyncBufRead + Unpin,
{
  let line = match read_request_line(reader).await? {
    Some(line) if !line.is_empty() => line,
    _ => return Ok(None),
  };
  let (method, target, version) = parse_request_line(&line)?;
  finish_request(reader, method, target, version).await.map(Some)
}

async fn read_headers<R>(reader: &mut R) -> Result<HeaderMap>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = HeaderMap::new();
  let mut line = Vec::new();
  let mut total = 0usize;
  loop {
    line.clear();
    let n = timed(HEADER_READ_TIMEOUT, reader.read_until(b'\n', &mut line)).await?;
    if n == 0 || line == b"\r\n" || line == b"\n" {
      return Ok(headers);
    }
    total += n;
    if total > MAX_HEADER_BLOCK {
      return Err(Error::invalid_request("header block too large"));
    }
    if let Some((name, value)) = parse_header_line(&line) {
      headers.append(name, value);
    }
  }
}

fn parse_header_line(line: &[u8]) -> Option<(HeaderName, HeaderValue)> {
  let line = line.strip_suffix(b"\r\n").or_else(|| line.strip_suffix(b"\n")).unwrap_or(line);
  let colon = line.iter().position(|b| *b == b':')?;
  let name = HeaderName::from_bytes(line[..colon].trim_ascii()).ok()?;
  let value = HeaderValue::from_bytes(line[colon + 1..].trim_ascii_start()).ok()?;
  Some((name, value))
}

async fn read_body<R>(reader: &mut R, headers: &HeaderMap) -> Result<Option<Vec<u8>>>
where
  R: AsyncBufRead + Unpin,
{
  if is_chunked(headers) {
    return read_chunked_body(reader).await.map(Some);
  }
  let length = headers
    .get(CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok()?.trim().parse::<usize>().ok());
  match length {
    Some(0) | None => Ok(None),
    Some(n) => {
      let mut body = vec![0u8; n];
      timed(HEADER_READ_TIMEOUT, reader.read_exact(&mut body)).await?;
      Ok(Some(body))
    }
  }
}

async fn read_chunked_body<R>(reader: &mut R) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = Vec::new();
  loop {
    let mut size_line = Vec::new();
    let n = timed(HEADER_READ_TIMEOUT, reader.read_until(b'\n', &mut size_line)).await?;
    if n == 0 {
      return Err(Error::invalid_request("client closed mid-chunk"));
    }
    let text = String::from_utf8_lossy(&size_line);
    let size = usize::from_str_radix(
      text.trim().split(';').next().unwrap_or_default().trim(),
      16,
    )
    .map_err(|_| Error::invalid_request("bad chunk size"))?;

    if size == 0 {
      // trailers, then the final blank line
      loop {
        let mut trailer = Vec::new();
        let n = timed(HEADER_READ_TIMEOUT, reader.read_until(b'\n', &mut trailer)).await?;
        if n == 0 || trailer == b"\r\n" || trailer == b"\n" {
          return Ok(body);
        }
      }
    }

    let mut chunk = vec![0u8; size];
    timed(HEADER_READ_TIMEOUT, reader.read_exact(&mut chunk)).await?;
    body.extend_from_slice(&chunk);
    let mut crlf = [0u8; 2];
    timed(HEADER_READ_TIMEOUT, reader.read_exact(&mut crlf)).await?;
  }
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get_all(TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .any(|v| v.to_ascii_lowercase().contains("chunked"))
}

/// Whether this request asks to become a WebSocket tunnel.
pub(crate) fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
  headers
    .get(UPGRADE)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.eq_ignore_ascii_case("websocket"))
    .unwrap_or(false)
}

/// Whether the connection should close after this exchange.
pub(crate) fn wants_close(headers: &HeaderMap, version: Version) -> bool {
  let connection = headers
    .get(CONNECTION)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.to_ascii_lowercase());
  match connection {
    Some(value) if value.contains("close") => true,
    Some(value) if value.contains("keep-alive") => false,
    _ => version == Version::HTTP_10,
  }
}
