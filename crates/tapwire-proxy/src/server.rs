//! Proxy front: accept loop, connection classification, shutdown.
//!
//! Each accepted socket gets its own task. The first request line decides
//! the path: `CONNECT` goes to interception (or a blind tunnel when
//! interception is off), anything else is treated as plaintext HTTP with
//! keep-alive. Every task is tracked in a registry so shutdown can tear the
//! fleet down in bounded time even with parked breakpoints or long-polling
//! sockets.

use crate::breakpoint::BreakpointManager;
use crate::error::{Error, Result};
use crate::events::ProxyEvent;
use crate::handler::{self, ClientFraming, ExchangeRequest};
use crate::inbound;
use crate::mitm;
use crate::proxy::ProxyEngine;
use http::Method;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info};

/// Grace period between signaling shutdown and force-closing everything.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
/// Cap on the discarded CONNECT header block.
const MAX_CONNECT_HEADERS: usize = 16 * 1024;

/// Tracks live connection tasks so shutdown can abort them.
pub(crate) struct ConnectionRegistry {
  next_id: AtomicU64,
  tasks: Mutex<HashMap<u64, AbortHandle>>,
}

impl ConnectionRegistry {
  pub(crate) fn new() -> Arc<Self> {
    Arc::new(Self {
      next_id: AtomicU64::new(1),
      tasks: Mutex::new(HashMap::new()),
    })
  }

  /// Spawn a tracked task; it removes itself from the registry when done.
  pub(crate) fn spawn<F>(self: &Arc<Self>, fut: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
    let registry = Arc::clone(self);
    let handle = tokio::spawn(async move {
      fut.await;
      registry.tasks.lock().remove(&id);
    });
    self.tasks.lock().insert(id, handle.abort_handle());
  }

  /// Abort every tracked task, destroying its sockets.
  pub(crate) fn abort_all(&self) {
    for (_, handle) in self.tasks.lock().drain() {
      handle.abort();
    }
  }

  /// Live connection count.
  pub(crate) fn len(&self) -> usize {
    self.tasks.lock().len()
  }
}

/// Handle for a running proxy.
pub struct ProxyHandle {
  addr: SocketAddr,
  shutdown_tx: broadcast::Sender<()>,
  accept_task: JoinHandle<()>,
  registry: Arc<ConnectionRegistry>,
  breakpoints: BreakpointManager,
}

impl ProxyHandle {
  pub(crate) fn new(
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
    registry: Arc<ConnectionRegistry>,
    breakpoints: BreakpointManager,
  ) -> Self {
    Self {
      addr,
      shutdown_tx,
      accept_task,
      registry,
      breakpoints,
    }
  }

  /// The bound listening address.
  pub fn addr(&self) -> SocketAddr {
    self.addr
  }

  /// Number of live client connections.
  pub fn connection_count(&self) -> usize {
    self.registry.len()
  }

  /// Signal shutdown without waiting.
  pub fn shutdown(&self) {
    let _ = self.shutdown_tx.send(());
  }

  /// Stop accepting, release parked breakpoints, force-close every
  /// connection, and wait out at most the shutdown grace period.
  pub async fn stop(self) {
    let _ = self.shutdown_tx.send(());
    self.breakpoints.clear_pending();
    self.registry.abort_all();

    let abort = self.accept_task.abort_handle();
    if tokio::time::timeout(SHUTDOWN_GRACE, self.accept_task)
      .await
      .is_err()
    {
      abort.abort();
    }
    info!("proxy stopped");
  }
}

/// Accept loop. Runs until the shutdown signal fires.
pub(crate) async fn run(
  engine: ProxyEngine,
  listener: TcpListener,
  registry: Arc<ConnectionRegistry>,
  mut shutdown_rx: broadcast::Receiver<()>,
) {
  loop {
    tokio::select! {
      _ = shutdown_rx.recv() => break,
      accepted = listener.accept() => match accepted {
        Ok((stream, peer)) => {
          let engine = engine.clone();
          registry.spawn(async move {
            if let Err(e) = handle_connection(engine, stream, peer).await {
              debug!("connection from {peer} ended: {e}");
            }
          });
        }
        Err(e) => {
          error!("accept failed: {e}");
          engine
            .events()
            .emit(ProxyEvent::Error(format!("accept failed: {e}")));
        }
      },
    }
  }
}

async fn handle_connection(
  engine: ProxyEngine,
  stream: TcpStream,
  peer: SocketAddr,
) -> Result<()> {
  stream.set_nodelay(true).ok();
  let mut reader = BufReader::new(stream);

  let line = match inbound::read_request_line(&mut reader).await {
    Ok(Some(line)) if !line.is_empty() => line,
    Ok(_) => return Ok(()),
    Err(e) => {
      let _ = handler::write_bad_request(&mut reader).await;
      return Err(e);
    }
  };

  let (method, target, version) = match inbound::parse_request_line(&line) {
    Ok(parsed) => parsed,
    Err(e) => {
      let _ = handler::write_bad_request(&mut reader).await;
      return Err(e);
    }
  };

  if method == Method::CONNECT {
    discard_connect_headers(&mut reader).await?;
    let (host, port) = match parse_authority(&target) {
      Ok(pair) => pair,
      Err(e) => {
        let _ = handler::write_bad_request(&mut reader).await;
        return Err(e);
      }
    };
    debug!("CONNECT {host}:{port} from {peer}");
    if engine.config().enable_https {
      mitm::intercept(&engine, reader, &host, port).await
    } else {
      blind_tunnel(reader, &host, port).await
    }
  } else {
    let request = inbound::finish_request(&mut reader, method, target, version).await?;
    plain_loop(engine, reader, request).await
  }
}

/// Serial keep-alive loop for plaintext requests.
async fn plain_loop(
  engine: ProxyEngine,
  mut reader: BufReader<TcpStream>,
  first: inbound::InboundRequest,
) -> Result<()> {
  let mut request = first;
  loop {
    let close = inbound::wants_close(&request.headers, request.version);

    if inbound::is_websocket_upgrade(&request.headers) {
      let req = ExchangeRequest::from_plain(request)?;
      handler::handle_upgrade(&engine, req, &mut reader).await?;
      return Ok(());
    }

    let req = match ExchangeRequest::from_plain(request) {
      Ok(req) => req,
      Err(e) => {
        let _ = handler::write_bad_request(&mut reader).await;
        return Err(e);
      }
    };
    let reusable = handler::process(&engine, req, &mut reader, ClientFraming::Stream).await?;
    if close || !reusable {
      return Ok(());
    }

    request = match inbound::read_request(&mut reader).await? {
      Some(request) => request,
      None => return Ok(()),
    };
  }
}

/// Pipe a CONNECT tunnel without looking inside.
async fn blind_tunnel(
  mut client: BufReader<TcpStream>,
  host: &str,
  port: u16,
) -> Result<()> {
  let mut upstream = match TcpStream::connect((host, port)).await {
    Ok(stream) => stream,
    Err(e) => {
      debug!("blind tunnel to {host}:{port} failed: {e}");
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
  let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
  Ok(())
}

/// Read and discard the header block of a CONNECT request.
async fn discard_connect_headers(reader: &mut BufReader<TcpStream>) -> Result<()> {
  let mut total = 0usize;
  loop {
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 || line == b"\r\n" || line == b"\n" {
      return Ok(());
    }
    total += n;
    if total > MAX_CONNECT_HEADERS {
      return Err(Error::invalid_request("CONNECT headers too large"));
    }
  }
}

/// Split `host:port`, defaulting the port to 443.
fn parse_authority(target: &str) -> Result<(String, u16)> {
  match target.rsplit_once(':') {
    Some((host, port)) if !host.contains(':') || host.starts_with('[') => {
      let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
      let port = port
        .parse::<u16>()
        .map_err(|_| Error::invalid_request(format!("bad CONNECT port in {target:?}")))?;
      Ok((host, port))
    }
    _ => {
      if target.is_empty() {
        return Err(Error::invalid_request("empty CONNECT target"));
      }
      Ok((target.to_string(), 443))
    }
  }
}
