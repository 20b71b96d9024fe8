//! Error types for the proxy engine.

use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the proxy engine.
#[derive(Error, Debug)]
pub enum Error {
  /// IO error.
  #[error("IO error: {0}")]
  Io(#[from] io::Error),

  /// Certificate generation or loading failed.
  #[error("certificate error: {0}")]
  Certificate(String),

  /// TLS negotiation failed.
  #[error("TLS error: {0}")]
  Tls(String),

  /// Malformed HTTP from a client.
  #[error("invalid request: {0}")]
  InvalidRequest(String),

  /// Upstream leg failed (connect, handshake, read).
  #[error("upstream error: {0}")]
  Upstream(String),

  /// Wire plumbing error.
  #[error(transparent)]
  Wire(#[from] tapwire::Error),

  /// HTTP type error.
  #[error(transparent)]
  Http(#[from] http::Error),

  /// Store error.
  #[error("store error: {0}")]
  Store(#[from] rusqlite::Error),

  /// The user dropped the message at a breakpoint. Distinguished so
  /// handlers can answer with a `499` instead of treating it as transport
  /// failure.
  #[error("request dropped by user")]
  Dropped,

  /// Anything else.
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a certificate error and log it.
  pub fn certificate(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a TLS error and log it.
  pub fn tls(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an invalid-request error and log it.
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create an upstream error. Logged at debug: these are routine for an
  /// interception tool (dead origins, refused connects).
  pub fn upstream(msg: impl Into<String>) -> Self {
    let error = Error::Upstream(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Whether this error was caused by the user dropping a message.
  pub fn is_dropped(&self) -> bool {
    matches!(self, Error::Dropped)
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}
