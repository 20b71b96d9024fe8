use crate::body::Body;
use crate::errors::{new_io_error, Result};
use crate::{COLON_SPACE, CR_LF};
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri};

/// A request headed for an origin server.
///
/// An `Outbound` carries an absolute URI; [`Outbound::to_raw`] serializes it
/// in origin-form (`GET /path HTTP/1.1`) with a `Host` header derived from
/// the URI authority when the caller did not supply one. Bodies are always
/// `Content-Length` framed on the wire: any `Transfer-Encoding` header is
/// discarded and `Content-Length` is rewritten to the actual body length.
#[derive(Debug, Clone, Default)]
pub struct Outbound {
  method: Method,
  uri: Uri,
  headers: HeaderMap,
  body: Option<Body>,
}

impl Outbound {
  /// Create a request for `method` and an absolute `uri`.
  pub fn new(method: Method, uri: Uri) -> Outbound {
    Outbound {
      method,
      uri,
      headers: HeaderMap::new(),
      body: None,
    }
  }

  /// Replace all headers.
  pub fn headers(mut self, headers: HeaderMap) -> Outbound {
    self.headers = headers;
    self
  }

  /// Append a single header.
  pub fn header<V>(mut self, name: HeaderName, value: V) -> Result<Outbound>
  where
    HeaderValue: TryFrom<V>,
    <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
  {
    let value = HeaderValue::try_from(value).map_err(|e| crate::Error::Http(e.into()))?;
    self.headers.append(name, value);
    Ok(self)
  }

  /// Set the body.
  pub fn body<B: Into<Body>>(mut self, body: B) -> Outbound {
    self.body = Some(body.into());
    self
  }

  /// The request method.
  pub fn method(&self) -> &Method {
    &self.method
  }

  /// The absolute request URI.
  pub fn uri(&self) -> &Uri {
    &self.uri
  }

  /// Host component of the URI.
  pub fn host(&self) -> Result<&str> {
    self
      .uri
      .host()
      .ok_or_else(|| new_io_error(std::io::ErrorKind::InvalidInput, "uri has no host"))
  }

  /// Port, defaulted by scheme.
  pub fn port(&self) -> u16 {
    self
      .uri
      .port_u16()
      .unwrap_or(if self.is_tls() { 443 } else { 80 })
  }

  /// Whether the upstream leg uses TLS.
  pub fn is_tls(&self) -> bool {
    self.uri.scheme() == Some(&http::uri::Scheme::HTTPS)
  }

  /// Serialize as raw HTTP/1.1 bytes, request line through body.
  pub fn to_raw(&self) -> Result<Bytes> {
    let path = self
      .uri
      .path_and_query()
      .map(|p| p.as_str())
      .unwrap_or("/");

    let mut raw = Vec::with_capacity(256 + self.body.as_ref().map(|b| b.len()).unwrap_or(0));
    raw.extend(self.method.as_str().as_bytes());
    raw.push(b' ');
    raw.extend(path.as_bytes());
    raw.extend(b" HTTP/1.1");
    raw.extend(CR_LF);

    if !self.headers.contains_key(HOST) {
      let host = self.host()?;
      raw.extend(b"host: ");
      match self.uri.port_u16() {
        Some(port) => raw.extend(format!("{host}:{port}").as_bytes()),
        None => raw.extend(host.as_bytes()),
      }
      raw.extend(CR_LF);
    }

    for (name, value) in self.headers.iter() {
      if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
        continue;
      }
      raw.extend(name.as_str().as_bytes());
      raw.extend(COLON_SPACE);
      raw.extend(value.as_bytes());
      raw.extend(CR_LF);
    }

    if let Some(body) = &self.body {
      raw.extend(format!("content-length: {}", body.len()).as_bytes());
      raw.extend(CR_LF);
    }

    raw.extend(CR_LF);
    if let Some(body) = &self.body {
      raw.extend(body.iter());
    }
    Ok(Bytes::from(raw))
  }
}
