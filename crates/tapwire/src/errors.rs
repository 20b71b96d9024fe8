//! Plumbing errors.
use std::io::ErrorKind;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `tapwire::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while speaking HTTP/1.x to an origin.
#[derive(ThisError, Debug)]
pub enum Error {
  /// TLS error from the rustls stack.
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// I/O error (connect, read, write, timeout).
  #[error(transparent)]
  Io(#[from] std::io::Error),
  /// Invalid HTTP data (malformed status line, header, uri).
  #[error(transparent)]
  Http(http::Error),
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

pub(crate) fn new_io_error(kind: ErrorKind, msg: &str) -> Error {
  Error::Io(std::io::Error::new(kind, msg))
}
