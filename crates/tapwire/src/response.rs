use crate::errors::{new_io_error, Error, Result};
use crate::{COLON_SPACE, CR_LF, MAX_LINE};
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Version};
use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::time::timeout;

const CHUNK_READ: usize = 8 * 1024;

/// Status line and headers of an origin response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
  /// HTTP version from the status line.
  pub version: Version,
  /// Response status code.
  pub status: StatusCode,
  /// Response headers, in wire order.
  pub headers: HeaderMap,
}

impl ResponseHead {
  /// `Content-Length`, if present and parseable.
  pub fn content_length(&self) -> Option<u64> {
    self
      .headers
      .get(CONTENT_LENGTH)
      .and_then(|v| v.to_str().ok()?.trim().parse().ok())
  }

  /// Whether the body uses chunked transfer encoding.
  pub fn is_chunked(&self) -> bool {
    self
      .headers
      .get_all(TRANSFER_ENCODING)
      .iter()
      .filter_map(|v| v.to_str().ok())
      .any(|v| v.to_ascii_lowercase().contains("chunked"))
  }

  /// Serialize the head verbatim: status line, headers, blank line.
  pub fn to_raw(&self) -> Bytes {
    let mut raw = Vec::with_capacity(256);
    raw.extend(format!("{:?}", self.version).as_bytes());
    raw.push(b' ');
    raw.extend(self.status.as_u16().to_string().as_bytes());
    raw.push(b' ');
    raw.extend(self.status.canonical_reason().unwrap_or("Unknown").as_bytes());
    raw.extend(CR_LF);
    for (name, value) in self.headers.iter() {
      raw.extend(name.as_str().as_bytes());
      raw.extend(COLON_SPACE);
      raw.extend(value.as_bytes());
      raw.extend(CR_LF);
    }
    raw.extend(CR_LF);
    Bytes::from(raw)
  }
}

enum Framing {
  /// `Content-Length` body, remaining bytes.
  Length(u64),
  /// Chunked body, currently between chunks.
  ChunkSize,
  /// Chunked body, remaining bytes of the current chunk.
  ChunkData(u64),
  /// No framing information: read until the origin closes.
  Close,
  /// Body fully consumed (or absent).
  Done,
}

/// A parsed response whose body is read incrementally.
///
/// [`next_chunk`](InboundResponse::next_chunk) yields decoded payload bytes
/// (chunked framing is stripped) until the body ends. The payload is exactly
/// the on-wire entity: if the origin compressed it, the chunks are still
/// compressed.
pub struct InboundResponse<S> {
  head: ResponseHead,
  reader: BufReader<S>,
  framing: Framing,
  read_timeout: Option<Duration>,
}

async fn timed<T, F>(limit: Option<Duration>, fut: F) -> Result<T>
where
  F: Future<Output = std::io::Result<T>>,
{
  match limit {
    Some(limit) => timeout(limit, fut)
      .await
      .map_err(|e| new_io_error(ErrorKind::TimedOut, &e.to_string()))?
      .map_err(Error::Io),
    None => fut.await.map_err(Error::Io),
  }
}

impl<S: AsyncRead + Unpin> InboundResponse<S> {
  /// Read the status line and headers off `stream`.
  ///
  /// `head_request` suppresses body reading for responses to `HEAD`, whose
  /// `Content-Length` describes a body that never arrives.
  pub async fn read(
    stream: S,
    head_request: bool,
    read_timeout: Option<Duration>,
  ) -> Result<InboundResponse<S>> {
    let mut reader = BufReader::new(stream);
    let (version, status) = parse_status_line(&mut reader, read_timeout).await?;
    let headers = read_header_block(&mut reader, read_timeout).await?;
    let head = ResponseHead {
      version,
      status,
      headers,
    };

    let framing = if head_request
      || head.status.is_informational()
      || head.status == StatusCode::NO_CONTENT
      || head.status == StatusCode::NOT_MODIFIED
    {
      Framing::Done
    } else if head.is_chunked() {
      Framing::ChunkSize
    } else {
      match head.content_length() {
        Some(0) => Framing::Done,
        Some(n) => Framing::Length(n),
        None => Framing::Close,
      }
    };

    Ok(InboundResponse {
      head,
      reader,
      framing,
      read_timeout,
    })
  }

  /// The parsed status line and headers.
  pub fn head(&self) -> &ResponseHead {
    &self.head
  }

  /// Next decoded payload chunk, or `None` once the body ends.
  pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
    loop {
      match self.framing {
        Framing::Done => return Ok(None),
        Framing::Length(remaining) => {
          let want = remaining.min(CHUNK_READ as u64) as usize;
          let mut buf = vec![0u8; want];
          let n = timed(self.read_timeout, self.reader.read(&mut buf)).await?;
          if n == 0 {
            return Err(new_io_error(
              ErrorKind::UnexpectedEof,
              "origin closed mid-body",
            ));
          }
          buf.truncate(n);
          let left = remaining - n as u64;
          self.framing = if left == 0 {
            Framing::Done
          } else {
            Framing::Length(left)
          };
          return Ok(Some(Bytes::from(buf)));
        }
        Framing::ChunkSize => {
          let size = self.read_chunk_size().await?;
          if size == 0 {
            self.discard_trailers().await?;
            self.framing = Framing::Done;
            return Ok(None);
          }
          self.framing = Framing::ChunkData(size);
        }
        Framing::ChunkData(remaining) => {
          let want = remaining.min(CHUNK_READ as u64) as usize;
          let mut buf = vec![0u8; want];
          timed(self.read_timeout, self.reader.read_exact(&mut buf)).await?;
          let left = remaining - want as u64;
          if left == 0 {
            // consume the CRLF that terminates the chunk data
            let mut crlf = [0u8; 2];
            timed(self.read_timeout, self.reader.read_exact(&mut crlf)).await?;
            self.framing = Framing::ChunkSize;
          } else {
            self.framing = Framing::ChunkData(left);
          }
          return Ok(Some(Bytes::from(buf)));
        }
        Framing::Close => {
          let mut buf = vec![0u8; CHUNK_READ];
          let n = timed(self.read_timeout, self.reader.read(&mut buf)).await?;
          if n == 0 {
            self.framing = Framing::Done;
            return Ok(None);
          }
          buf.truncate(n);
          return Ok(Some(Bytes::from(buf)));
        }
      }
    }
  }

  /// Drain the remaining body into a single buffer.
  pub async fn collect(mut self) -> Result<(ResponseHead, Vec<u8>)> {
    let mut body = Vec::new();
    while let Some(chunk) = self.next_chunk().await? {
      body.extend_from_slice(&chunk);
    }
    Ok((self.head, body))
  }

  /// Give the underlying reader back, e.g. to splice a tunneled upgrade.
  ///
  /// Bytes already buffered by the reader stay readable through it.
  pub fn into_parts(self) -> (ResponseHead, BufReader<S>) {
    (self.head, self.reader)
  }

  async fn read_chunk_size(&mut self) -> Result<u64> {
    let mut line = Vec::new();
    let n = timed(
      self.read_timeout,
      self.reader.read_until(b'\n', &mut line),
    )
    .await?;
    if n == 0 || line.len() > MAX_LINE {
      return Err(new_io_error(ErrorKind::InvalidData, "bad chunk size line"));
    }
    let text = String::from_utf8_lossy(&line);
    let size = text
      .trim()
      .split(';')
      .next()
      .unwrap_or_default()
      .trim();
    u64::from_str_radix(size, 16)
      .map_err(|_| new_io_error(ErrorKind::InvalidData, "bad chunk size"))
  }

  async fn discard_trailers(&mut self) -> Result<()> {
    loop {
      let mut line = Vec::new();
      let n = timed(
        self.read_timeout,
        self.reader.read_until(b'\n', &mut line),
      )
      .await?;
      if n == 0 || line == b"\r\n" || line == b"\n" {
        return Ok(());
      }
      if line.len() > MAX_LINE {
        return Err(new_io_error(ErrorKind::InvalidData, "oversized trailer"));
      }
    }
  }
}

async fn parse_status_line<S: AsyncRead + Unpin>(
  reader: &mut BufReader<S>,
  read_timeout: Option<Duration>,
) -> Result<(Version, StatusCode)> {
  let mut line = Vec::new();
  let n = timed(read_timeout, reader.read_until(b'\n', &mut line)).await?;
  if n == 0 {
    return Err(new_io_error(
      ErrorKind::UnexpectedEof,
      "origin closed before status line",
    ));
  }
  if line.len() > MAX_LINE {
    return Err(new_io_error(ErrorKind::InvalidData, "oversized status line"));
  }

  let mut parts = line.splitn(3, |b| *b == b' ');
  let version = match parts.next() {
    Some(b"HTTP/1.0") => Version::HTTP_10,
    Some(b"HTTP/1.1") => Version::HTTP_11,
    Some(b"HTTP/0.9") => Version::HTTP_09,
    _ => {
      return Err(new_io_error(ErrorKind::InvalidData, "invalid http version"));
    }
  };
  let status = parts
    .next()
    .map(|s| s.strip_suffix(CR_LF).unwrap_or(s))
    .and_then(|s| StatusCode::from_bytes(s).ok())
    .ok_or_else(|| new_io_error(ErrorKind::InvalidData, "invalid status code"))?;
  Ok((version, status))
}

async fn read_header_block<S: AsyncRead + Unpin>(
  reader: &mut BufReader<S>,
  read_timeout: Option<Duration>,
) -> Result<HeaderMap> {
  let mut headers = HeaderMap::new();
  let mut line = Vec::new();
  loop {
    line.clear();
    let n = timed(read_timeout, reader.read_until(b'\n', &mut line)).await?;
    if n == 0 || line == b"\r\n" || line == b"\n" {
      return Ok(headers);
    }
    if line.len() > MAX_LINE {
      return Err(new_io_error(ErrorKind::InvalidData, "oversized header line"));
    }
    if let Some((name, value)) = parse_header_line(&line) {
      headers.append(name, value);
    }
  }
}

/// Split a raw header line into a (lowercased) name and verbatim value.
/// Lines that do not parse as headers are dropped, matching lenient servers.
pub(crate) fn parse_header_line(line: &[u8]) -> Option<(HeaderName, HeaderValue)> {
  let line = line.strip_suffix(CR_LF).unwrap_or(line);
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  let colon = line.iter().position(|b| *b == b':')?;
  let name = HeaderName::from_bytes(line[..colon].trim_ascii()).ok()?;
  let value = HeaderValue::from_bytes(line[colon + 1..].trim_ascii_start()).ok()?;
  Some((name, value))
}
