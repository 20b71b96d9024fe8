use crate::errors::{new_io_error, Result};
use crate::tls::insecure_client_config;
use std::io::ErrorKind;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// A connected upstream socket, plaintext or TLS.
#[derive(Debug)]
pub enum Stream {
  /// Plain TCP connection.
  Tcp(TcpStream),
  /// TLS session over TCP.
  Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
      Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for Stream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    match self.get_mut() {
      Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
      Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
      Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
      Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
    }
  }
}

/// Opens upstream connections.
///
/// DNS resolution goes through the system resolver. TLS upgrades accept any
/// server certificate and advertise `http/1.1` only.
#[derive(Clone)]
pub struct Connector {
  connect_timeout: Duration,
  tls: TlsConnector,
}

impl Default for Connector {
  fn default() -> Self {
    Connector::new(Duration::from_secs(10))
  }
}

impl Connector {
  /// Create a connector with the given connect-phase timeout.
  pub fn new(connect_timeout: Duration) -> Connector {
    Connector {
      connect_timeout,
      tls: TlsConnector::from(Arc::new(insecure_client_config())),
    }
  }

  /// Open a plain TCP connection to `host:port`.
  pub async fn connect(&self, host: &str, port: u16) -> Result<Stream> {
    tracing::debug!("connecting to {host}:{port}");
    let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
      .await
      .map_err(|e| new_io_error(ErrorKind::TimedOut, &e.to_string()))??;
    stream.set_nodelay(true)?;
    Ok(Stream::Tcp(stream))
  }

  /// Open a TCP connection to `host:port` and run a TLS handshake over it.
  pub async fn connect_tls(&self, host: &str, port: u16) -> Result<Stream> {
    let stream = self.connect(host, port).await?;
    self.upgrade(stream, host).await
  }

  /// Upgrade an existing plain connection to TLS with SNI `host`.
  ///
  /// Already-TLS streams pass through unchanged.
  pub async fn upgrade(&self, stream: Stream, host: &str) -> Result<Stream> {
    match stream {
      Stream::Tcp(tcp) => {
        tracing::debug!("tls handshake with {host}");
        let name = ServerName::try_from(host.to_owned())
          .map_err(|_| new_io_error(ErrorKind::InvalidInput, "invalid sni host"))?;
        let tls = tokio::time::timeout(self.connect_timeout, self.tls.connect(name, tcp))
          .await
          .map_err(|e| new_io_error(ErrorKind::TimedOut, &e.to_string()))??;
        Ok(Stream::Tls(Box::new(tls)))
      }
      tls @ Stream::Tls(_) => Ok(tls),
    }
  }
}
