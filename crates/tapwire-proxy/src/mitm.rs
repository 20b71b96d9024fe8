//! TLS interception of CONNECT tunnels.
//!
//! The tunnel is answered with `200 Connection Established`, then the
//! client's TLS is terminated locally with a leaf certificate minted for the
//! CONNECT host. The cleartext inside is ordinary HTTP/1.1: requests are
//! parsed by the shared reader and run through the shared pipeline with
//! buffered framing (the response is re-framed with a rewritten
//! `Content-Length`).
//!
//! Handshake failures are routine here — certificate-pinning apps abort as
//! soon as they see the minted leaf — so the noisy error families stay at
//! debug level.

use crate::error::Result;
use crate::handler::{self, ClientFraming, ExchangeRequest};
use crate::inbound;
use crate::proxy::ProxyEngine;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

/// Error families that pinning clients and flaky mobiles produce in bulk.
fn is_quiet_tls_error(message: &str) -> bool {
  let message = message.to_ascii_lowercase();
  [
    "connection reset",
    "broken pipe",
    "unsupported protocol",
    "inappropriate fallback",
    "unexpected message",
    "decrypt",
    "close_notify",
  ]
  .iter()
  .any(|needle| message.contains(needle))
}

/// Intercept a CONNECT tunnel to `host:port`.
pub(crate) async fn intercept<C>(
  engine: &ProxyEngine,
  mut client: C,
  host: &str,
  port: u16,
) -> Result<()>
where
  C: AsyncRead + AsyncWrite + Unpin,
{
  // Leaf minting failure turns into a 502 on the tunnel, before any TLS.
  let tls_config = match engine.certs().server_config(host).await {
    Ok(config) => config,
    Err(e) => {
      debug!("cannot intercept {host}: {e}");
      client
        .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
        .await?;
      client.flush().await?;
      return Ok(());
    }
  };

  client
    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
    .await?;
  client.flush().await?;

  let acceptor = TlsAcceptor::from(Arc::clone(&tls_config));
  let tls = match acceptor.accept(client).await {
    Ok(tls) => tls,
    Err(e) => {
      let message = e.to_string();
      if is_quiet_tls_error(&message) {
        debug!("client handshake for {host} aborted: {message}");
      } else {
        tracing::warn!("client handshake for {host} failed: {message}");
      }
      return Ok(());
    }
  };

  let mut reader = BufReader::new(tls);
  loop {
    let request = match inbound::read_request(&mut reader).await {
      Ok(Some(request)) => request,
      Ok(None) => break,
      Err(e) => {
        debug!("tunnel to {host} ended: {e}");
        break;
      }
    };
    let close = inbound::wants_close(&request.headers, request.version);

    if inbound::is_websocket_upgrade(&request.headers) {
      let req = ExchangeRequest::from_tunnel(request, host, port);
      let _ = handler::handle_upgrade(engine, req, &mut reader).await;
      break;
    }

    let req = ExchangeRequest::from_tunnel(request, host, port);
    match handler::process(engine, req, &mut reader, ClientFraming::Buffer).await {
      Ok(_) => {}
      Err(e) => {
        debug!("exchange inside tunnel to {host} failed: {e}");
        break;
      }
    }
    if close {
      break;
    }
  }
  Ok(())
}
