//! Body storage policy.
//!
//! The wire is sacred: clients always receive exactly the bytes the origin
//! sent. These helpers only shape the *stored* copy — decompressing it,
//! coercing it to UTF-8, and replacing it with a placeholder when it is too
//! large or not text.

use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use http::HeaderMap;
use std::io::Read;

/// Stored in place of a body that does not decode as UTF-8.
pub(crate) const BINARY_PLACEHOLDER: &str = "[Binary data]";

/// Placeholder for an oversized stored response body.
pub(crate) fn oversize_placeholder(len: u64) -> String {
  format!("[Body too large: {len} bytes]")
}

/// Placeholder for an oversized stored request body.
pub(crate) fn request_oversize_placeholder(len: u64) -> String {
  format!("[Request body too large: {len} bytes]")
}

/// First `;`-separated token of the response content type.
pub(crate) fn content_type_of(headers: &HeaderMap) -> Option<String> {
  headers
    .get(CONTENT_TYPE)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
    .filter(|v| !v.is_empty())
}

/// `Content-Encoding` value, lowercased.
pub(crate) fn content_encoding_of(headers: &HeaderMap) -> Option<String> {
  headers
    .get(CONTENT_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.trim().to_ascii_lowercase())
}

/// Decompress `data` per `encoding`. `None` means the bytes should be kept
/// as-is: unknown encoding, or the decoder choked on them.
pub(crate) fn decompress(data: &[u8], encoding: &str) -> Option<Vec<u8>> {
  match encoding {
    "gzip" | "x-gzip" => {
      let mut out = Vec::new();
      flate2::read::MultiGzDecoder::new(data)
        .read_to_end(&mut out)
        .ok()?;
      Some(out)
    }
    "deflate" => {
      // Origins disagree on whether "deflate" means zlib-wrapped or raw.
      let mut out = Vec::new();
      if flate2::read::ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .is_ok()
      {
        return Some(out);
      }
      let mut out = Vec::new();
      flate2::read::DeflateDecoder::new(data)
        .read_to_end(&mut out)
        .ok()?;
      Some(out)
    }
    "br" => {
      let mut out = Vec::new();
      brotli::Decompressor::new(data, 4096)
        .read_to_end(&mut out)
        .ok()?;
      Some(out)
    }
    _ => None,
  }
}

/// Coerce raw bytes to the stored string form.
fn coerce_utf8(data: Vec<u8>) -> String {
  match String::from_utf8(data) {
    Ok(text) => text,
    Err(_) => BINARY_PLACEHOLDER.to_string(),
  }
}

/// Stored form of a request body. The full body is forwarded regardless;
/// only the stored copy is capped.
pub(crate) fn stored_request_body(body: Option<&[u8]>, cap: usize) -> Option<String> {
  let body = body.filter(|b| !b.is_empty())?;
  if body.len() > cap {
    return Some(request_oversize_placeholder(body.len() as u64));
  }
  Some(coerce_utf8(body.to_vec()))
}

/// Stored form of a response body.
///
/// `captured` holds at most the first `cap` wire bytes; `wire_len` is the
/// full on-wire length. Decompression applies only here — the client already
/// received the still-compressed bytes.
pub(crate) fn stored_response_body(
  captured: &[u8],
  wire_len: u64,
  content_encoding: Option<&str>,
  cap: usize,
) -> Option<String> {
  if wire_len == 0 {
    return None;
  }
  if wire_len > cap as u64 {
    // The capture buffer stopped at the cap; the decompressed length is
    // unknowable without the tail, so account with the wire length.
    return Some(oversize_placeholder(wire_len));
  }

  let decoded = content_encoding
    .and_then(|encoding| decompress(captured, encoding))
    .unwrap_or_else(|| captured.to_vec());
  if decoded.len() > cap {
    return Some(oversize_placeholder(decoded.len() as u64));
  }
  Some(coerce_utf8(decoded))
}
