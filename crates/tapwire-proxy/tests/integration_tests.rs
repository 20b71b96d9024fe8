//! End-to-end tests for tapwire-proxy: real sockets on both legs, stub
//! origins, and assertions against the store and the event bus.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tapwire::{InboundResponse, ResponseHead};
use tapwire_proxy::{
  BreakpointConfig, CertificateAuthority, CertificateFactory, LeafCert, NewMockRule,
  ProxyConfig, ProxyEngine, ProxyEvent, TrafficFilter,
};
use tempfile::TempDir;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// What the stub origin saw for one request.
#[derive(Debug, Clone)]
struct SeenRequest {
  method: String,
  path: String,
  host: String,
  body: Vec<u8>,
}

struct Origin {
  addr: SocketAddr,
  connections: Arc<AtomicUsize>,
}

impl Origin {
  fn connection_count(&self) -> usize {
    self.connections.load(Ordering::SeqCst)
  }
}

async fn read_stub_request<R>(reader: &mut R) -> Option<SeenRequest>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = String::new();
  if reader.read_line(&mut line).await.ok()? == 0 {
    return None;
  }
  let mut parts = line.split_whitespace();
  let method = parts.next()?.to_string();
  let path = parts.next()?.to_string();

  let mut content_length = 0usize;
  let mut host = String::new();
  loop {
    let mut header = String::new();
    if reader.read_line(&mut header).await.ok()? == 0 {
      return None;
    }
    if header == "\r\n" || header == "\n" {
      break;
    }
    if let Some((name, value)) = header.split_once(':') {
      if name.trim().eq_ignore_ascii_case("content-length") {
        content_length = value.trim().parse().unwrap_or(0);
      } else if name.trim().eq_ignore_ascii_case("host") {
        host = value.trim().to_string();
      }
    }
  }
  let mut body = vec![0u8; content_length];
  if content_length > 0 {
    reader.read_exact(&mut body).await.ok()?;
  }
  Some(SeenRequest {
    method,
    path,
    host,
    body,
  })
}

/// Plaintext origin stub. `respond` builds the raw response for each
/// request; connections are counted and every request is reported.
async fn spawn_origin<F>(respond: F) -> Origin
where
  F: Fn(&SeenRequest) -> Vec<u8> + Send + Sync + 'static,
{
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let connections = Arc::new(AtomicUsize::new(0));

  let accepted = connections.clone();
  tokio::spawn(async move {
    let respond = Arc::new(respond);
    while let Ok((stream, _)) = listener.accept().await {
      accepted.fetch_add(1, Ordering::SeqCst);
      let respond = respond.clone();
      tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        while let Some(request) = read_stub_request(&mut reader).await {
          let response = respond(&request);
          if reader.get_mut().write_all(&response).await.is_err() {
            break;
          }
        }
      });
    }
  });

  Origin { addr, connections }
}

fn plain_response(status: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
  let mut raw = format!(
    "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
    body.len()
  )
  .into_bytes();
  raw.extend(body);
  raw
}

async fn spawn_engine(config: ProxyConfig) -> (ProxyEngine, tapwire_proxy::ProxyHandle, TempDir) {
  let dir = TempDir::new().unwrap();
  let config = ProxyConfig {
    data_dir: dir.path().to_path_buf(),
    ..config
  }
  .with_port(0);
  let engine = ProxyEngine::new(config).await.unwrap();
  let handle = engine.start().await.unwrap();
  (engine, handle, dir)
}

/// Read one full response off `response`, handing the reader back for
/// keep-alive reuse.
async fn read_full<S>(mut response: InboundResponse<S>) -> (ResponseHead, Vec<u8>, BufReader<S>)
where
  S: AsyncRead + Unpin,
{
  let mut body = Vec::new();
  while let Some(chunk) = response.next_chunk().await.unwrap() {
    body.extend_from_slice(&chunk);
  }
  let (head, reader) = response.into_parts();
  (head, body, reader)
}

async fn request_via_proxy(proxy: SocketAddr, raw: Vec<u8>) -> (ResponseHead, Vec<u8>) {
  let mut stream = TcpStream::connect(proxy).await.unwrap();
  stream.write_all(&raw).await.unwrap();
  let response = InboundResponse::read(stream, false, Some(TEST_TIMEOUT))
    .await
    .unwrap();
  let (head, body, _) = read_full(response).await;
  (head, body)
}

async fn await_complete(
  rx: &mut tokio::sync::broadcast::Receiver<ProxyEvent>,
) -> tapwire_proxy::CapturedExchange {
  loop {
    let event = tokio::time::timeout(TEST_TIMEOUT, rx.recv())
      .await
      .expect("timed out waiting for request:complete")
      .expect("event bus closed");
    if let ProxyEvent::RequestComplete(row) = event {
      return row;
    }
  }
}

#[tokio::test]
async fn plain_get_round_trip_is_recorded() {
  let origin = spawn_origin(|_| plain_response("200 OK", "text/plain", b"hello")).await;
  let (engine, handle, _dir) = spawn_engine(ProxyConfig::new(".")).await;
  let mut events = engine.events().subscribe();

  let url = format!("http://127.0.0.1:{}/hi", origin.addr.port());
  let raw = format!("GET {url} HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n").into_bytes();
  let (head, body) = request_via_proxy(handle.addr(), raw).await;
  assert_eq!(head.status.as_u16(), 200);
  assert_eq!(body, b"hello");

  let row = await_complete(&mut events).await;
  assert_eq!(row.method, "GET");
  assert_eq!(row.url, url);
  assert_eq!(row.host, "127.0.0.1");
  assert_eq!(row.path, "/hi");
  assert_eq!(row.status, 200);
  assert_eq!(row.size, 5);
  assert_eq!(row.response_body.as_deref(), Some("hello"));
  assert_eq!(row.content_type.as_deref(), Some("text/plain"));

  // The event fires only after the row is final in the store.
  let read_back = engine.store().get_by_id(row.id).unwrap().unwrap();
  assert_eq!(read_back.status, 200);

  handle.stop().await;
}

#[tokio::test]
async fn gzip_bodies_pass_through_compressed_but_store_decompressed() {
  use flate2::write::GzEncoder;
  use std::io::Write;

  let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
  encoder.write_all(b"{\"ok\":true}").unwrap();
  let gzipped = encoder.finish().unwrap();
  let wire_len = gzipped.len();

  let payload = gzipped.clone();
  let origin = spawn_origin(move |_| {
    let mut raw = format!(
      "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
      payload.len()
    )
    .into_bytes();
    raw.extend(&payload);
    raw
  })
  .await;

  let (engine, handle, _dir) = spawn_engine(ProxyConfig::new(".")).await;
  let mut events = engine.events().subscribe();

  let url = format!("http://127.0.0.1:{}/data", origin.addr.port());
  let raw = format!("GET {url} HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n").into_bytes();
  let (head, body) = request_via_proxy(handle.addr(), raw).await;

  // The client sees the on-wire compressed bytes untouched.
  assert_eq!(head.status.as_u16(), 200);
  assert_eq!(body, gzipped);

  // The store holds the decompressed text and accounts on-wire size.
  let row = await_complete(&mut events).await;
  assert_eq!(row.response_body.as_deref(), Some("{\"ok\":true}"));
  assert_eq!(row.size, wire_len as i64);

  handle.stop().await;
}

#[tokio::test]
async fn matching_mock_rule_short_circuits_the_origin() {
  let origin = spawn_origin(|_| plain_response("200 OK", "text/plain", b"real")).await;
  let (engine, handle, _dir) = spawn_engine(ProxyConfig::new(".")).await;
  let mut events = engine.events().subscribe();

  engine
    .mocks()
    .add(NewMockRule {
      name: "teapot".into(),
      enabled: true,
      method: None,
      url_pattern: ".*/api.*".into(),
      response_status: 418,
      response_headers: vec![("content-type".into(), "text/plain".into())],
      response_body: "teapot".into(),
      delay_ms: 50,
    })
    .unwrap();

  let url = format!("http://127.0.0.1:{}/api/foo", origin.addr.port());
  let raw = format!("GET {url} HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n").into_bytes();
  let started = Instant::now();
  let (head, body) = request_via_proxy(handle.addr(), raw).await;

  assert_eq!(head.status.as_u16(), 418);
  assert_eq!(body, b"teapot");
  assert!(started.elapsed() >= Duration::from_millis(50));
  assert_eq!(origin.connection_count(), 0, "origin must stay untouched");

  let row = await_complete(&mut events).await;
  assert_eq!(row.status, 418);
  assert!(row.duration_ms >= 50);

  handle.stop().await;
}

#[tokio::test]
async fn breakpoint_resume_with_edits_changes_what_the_origin_sees() {
  let origin = spawn_origin(|request| {
    plain_response("200 OK", "text/plain", &request.body)
  })
  .await;
  let (engine, handle, _dir) = spawn_engine(ProxyConfig::new(".")).await;
  let mut events = engine.events().subscribe();

  engine.breakpoints().set_config(BreakpointConfig {
    enabled: true,
    break_on_request: true,
    break_on_response: false,
    url_pattern: Some(".*".into()),
  });

  let url = format!("http://127.0.0.1:{}/p", origin.addr.port());
  let raw =
    format!("POST {url} HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Length: 1\r\n\r\nA").into_bytes();
  let proxy = handle.addr();
  let client = tokio::spawn(async move { request_via_proxy(proxy, raw).await });

  // Controller: receive the hit, flip the body, resume.
  let hit = loop {
    match tokio::time::timeout(TEST_TIMEOUT, events.recv())
      .await
      .unwrap()
      .unwrap()
    {
      ProxyEvent::BreakpointHit(hit) => break hit,
      _ => continue,
    }
  };
  assert_eq!(hit.body.as_deref(), Some(b"A".as_ref()));
  let mut edited = hit.clone();
  edited.body = Some(b"B".to_vec());
  engine.breakpoints().resume(hit.id, Some(edited));

  let (head, body) = client.await.unwrap();
  assert_eq!(head.status.as_u16(), 200);
  assert_eq!(body, b"B", "origin echoed the edited body");

  // The stored row keeps the original body for audit.
  let row = await_complete(&mut events).await;
  assert_eq!(row.request_body.as_deref(), Some("A"));

  handle.stop().await;
}

#[tokio::test]
async fn breakpoint_drop_answers_499_without_touching_the_origin() {
  let origin = spawn_origin(|_| plain_response("200 OK", "text/plain", b"never")).await;
  let (engine, handle, _dir) = spawn_engine(ProxyConfig::new(".")).await;
  let mut events = engine.events().subscribe();

  engine.breakpoints().set_config(BreakpointConfig {
    enabled: true,
    break_on_request: true,
    break_on_response: false,
    url_pattern: None,
  });

  let url = format!("http://127.0.0.1:{}/p", origin.addr.port());
  let raw = format!("GET {url} HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n").into_bytes();
  let proxy = handle.addr();
  let client = tokio::spawn(async move { request_via_proxy(proxy, raw).await });

  let hit = loop {
    match tokio::time::timeout(TEST_TIMEOUT, events.recv())
      .await
      .unwrap()
      .unwrap()
    {
      ProxyEvent::BreakpointHit(hit) => break hit,
      _ => continue,
    }
  };
  engine.breakpoints().drop_message(hit.id);

  let (head, body) = client.await.unwrap();
  assert_eq!(head.status.as_u16(), 499);
  assert_eq!(body, b"Request dropped by user");
  assert_eq!(origin.connection_count(), 0);

  let row = await_complete(&mut events).await;
  assert_eq!(row.status, 499);

  handle.stop().await;
}

#[tokio::test]
async fn unreachable_upstream_becomes_a_recorded_502() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let dead_port = listener.local_addr().unwrap().port();
  drop(listener);

  let (engine, handle, _dir) = spawn_engine(ProxyConfig::new(".")).await;
  let mut events = engine.events().subscribe();

  let url = format!("http://127.0.0.1:{dead_port}/x");
  let raw = format!("GET {url} HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n").into_bytes();
  let (head, _) = request_via_proxy(handle.addr(), raw).await;
  assert_eq!(head.status.as_u16(), 502);

  let row = await_complete(&mut events).await;
  assert_eq!(row.status, 502);
  assert!(row.response_body.is_some());

  handle.stop().await;
}

#[tokio::test]
async fn keep_alive_serves_sequential_requests_on_one_connection() {
  let origin = spawn_origin(|request| {
    plain_response("200 OK", "text/plain", request.path.as_bytes())
  })
  .await;
  let (engine, handle, _dir) = spawn_engine(ProxyConfig::new(".")).await;

  let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
  let base = format!("http://127.0.0.1:{}", origin.addr.port());

  stream
    .write_all(format!("GET {base}/first HTTP/1.1\r\nHost: h\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let response = InboundResponse::read(stream, false, Some(TEST_TIMEOUT))
    .await
    .unwrap();
  let (_, body, mut reader) = read_full(response).await;
  assert_eq!(body, b"/first");

  reader
    .write_all(format!("GET {base}/second HTTP/1.1\r\nHost: h\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let response = InboundResponse::read(reader, false, Some(TEST_TIMEOUT))
    .await
    .unwrap();
  let (_, body, _) = read_full(response).await;
  assert_eq!(body, b"/second");

  assert_eq!(
    engine.store().count(&TrafficFilter::default()).unwrap(),
    2
  );
  handle.stop().await;
}

#[tokio::test]
async fn bad_first_line_gets_a_literal_400() {
  let (_engine, handle, _dir) = spawn_engine(ProxyConfig::new(".")).await;

  let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
  stream.write_all(b"garbage\r\n\r\n").await.unwrap();
  let mut reply = Vec::new();
  tokio::time::timeout(TEST_TIMEOUT, stream.read_to_end(&mut reply))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(reply, b"HTTP/1.1 400 Bad Request\r\n\r\n");

  handle.stop().await;
}

#[tokio::test]
async fn websocket_upgrade_splices_and_records_one_row() {
  // Origin speaks the handshake by hand, then echoes raw bytes.
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    let (stream, _) = listener.accept().await.unwrap();
    let mut reader = BufReader::new(stream);
    let _ = read_stub_request(&mut reader).await;
    reader
      .get_mut()
      .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
      .await
      .unwrap();
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).await.unwrap();
    reader.get_mut().write_all(&buf).await.unwrap();
  });

  let (engine, handle, _dir) = spawn_engine(ProxyConfig::new(".")).await;
  let mut events = engine.events().subscribe();

  let url = format!("http://127.0.0.1:{}/socket", origin_addr.port());
  let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
  stream
    .write_all(
      format!("GET {url} HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
        .as_bytes(),
    )
    .await
    .unwrap();

  let mut reader = BufReader::new(stream);
  let mut line = String::new();
  reader.read_line(&mut line).await.unwrap();
  assert!(line.starts_with("HTTP/1.1 101"));
  loop {
    line.clear();
    reader.read_line(&mut line).await.unwrap();
    if line == "\r\n" {
      break;
    }
  }

  // Tunnel is spliced: bytes echo end to end.
  reader.get_mut().write_all(b"ping").await.unwrap();
  let mut echo = [0u8; 4];
  tokio::time::timeout(TEST_TIMEOUT, reader.read_exact(&mut echo))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(&echo, b"ping");

  let row = await_complete(&mut events).await;
  assert_eq!(row.method, "WEBSOCKET");
  assert_eq!(row.status, 101);

  handle.stop().await;
}

struct CountingFactory {
  inner: CertificateAuthority,
  minted: AtomicUsize,
}

impl CertificateFactory for CountingFactory {
  fn mint(&self, host: &str) -> tapwire_proxy::Result<LeafCert> {
    self.minted.fetch_add(1, Ordering::SeqCst);
    self.inner.mint(host)
  }
}

#[tokio::test]
async fn connect_mitm_round_trip_records_https_urls_and_reuses_the_leaf() {
  use tokio_rustls::rustls::pki_types::ServerName;
  use tokio_rustls::TlsConnector;

  // TLS origin with its own throwaway self-signed cert.
  let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin_listener.local_addr().unwrap();
  tokio::spawn(async move {
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec!["127.0.0.1".to_string()])
      .unwrap()
      .self_signed(&key)
      .unwrap();
    let server_config = tokio_rustls::rustls::ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(
        vec![cert.der().clone()],
        tokio_rustls::rustls::pki_types::PrivateKeyDer::try_from(key.serialize_der()).unwrap(),
      )
      .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));
    while let Ok((stream, _)) = origin_listener.accept().await {
      let acceptor = acceptor.clone();
      tokio::spawn(async move {
        let Ok(tls) = acceptor.accept(stream).await else {
          return;
        };
        let mut reader = BufReader::new(tls);
        while let Some(request) = read_stub_request(&mut reader).await {
          let body = format!("secure {}", request.path);
          let response = plain_response("200 OK", "text/plain", body.as_bytes());
          if reader.get_mut().write_all(&response).await.is_err() {
            break;
          }
        }
      });
    }
  });

  // Engine with a counting leaf factory.
  let dir = TempDir::new().unwrap();
  let factory = Arc::new(CountingFactory {
    inner: CertificateAuthority::open(dir.path().join("ca")).await.unwrap(),
    minted: AtomicUsize::new(0),
  });
  let engine = ProxyEngine::with_certificate_factory(
    ProxyConfig::new(dir.path()).with_port(0),
    factory.clone(),
  )
  .unwrap();
  let handle = engine.start().await.unwrap();
  let mut events = engine.events().subscribe();

  // CONNECT, then TLS inside the tunnel.
  let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
  stream
    .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", origin_addr.port()).as_bytes())
    .await
    .unwrap();
  let mut reader = BufReader::new(stream);
  let mut line = String::new();
  reader.read_line(&mut line).await.unwrap();
  assert!(line.starts_with("HTTP/1.1 200"), "got {line:?}");
  line.clear();
  reader.read_line(&mut line).await.unwrap();
  assert_eq!(line, "\r\n");

  let connector = TlsConnector::from(Arc::new(tapwire::tls::insecure_client_config()));
  let tls = connector
    .connect(ServerName::try_from("127.0.0.1").unwrap(), reader.into_inner())
    .await
    .unwrap();

  // First request inside the tunnel.
  let mut tls = tls;
  tls
    .write_all(b"GET /x HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
    .await
    .unwrap();
  let response = InboundResponse::read(tls, false, Some(TEST_TIMEOUT)).await.unwrap();
  let (head, body, mut tls) = read_full(response).await;
  assert_eq!(head.status.as_u16(), 200);
  assert_eq!(body, b"secure /x");

  let row = await_complete(&mut events).await;
  assert_eq!(
    row.url,
    format!("https://127.0.0.1:{}/x", origin_addr.port())
  );
  assert_eq!(row.host, "127.0.0.1");
  assert_eq!(row.status, 200);

  // Second request on the same tunnel: no new leaf is minted.
  tls
    .write_all(b"GET /y HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
    .await
    .unwrap();
  let response = InboundResponse::read(tls, false, Some(TEST_TIMEOUT)).await.unwrap();
  let (_, body, _) = read_full(response).await;
  assert_eq!(body, b"secure /y");

  let row = await_complete(&mut events).await;
  assert_eq!(
    row.url,
    format!("https://127.0.0.1:{}/y", origin_addr.port())
  );
  assert_eq!(factory.minted.load(Ordering::SeqCst), 1);

  handle.stop().await;
}

#[tokio::test]
async fn mitm_replaces_a_mismatched_inner_host_with_the_connect_target() {
  use tokio_rustls::rustls::pki_types::ServerName;
  use tokio_rustls::TlsConnector;

  // TLS origin that answers with the Host header it was sent.
  let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin_listener.local_addr().unwrap();
  tokio::spawn(async move {
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec!["127.0.0.1".to_string()])
      .unwrap()
      .self_signed(&key)
      .unwrap();
    let server_config = tokio_rustls::rustls::ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(
        vec![cert.der().clone()],
        tokio_rustls::rustls::pki_types::PrivateKeyDer::try_from(key.serialize_der()).unwrap(),
      )
      .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));
    while let Ok((stream, _)) = origin_listener.accept().await {
      let acceptor = acceptor.clone();
      tokio::spawn(async move {
        let Ok(tls) = acceptor.accept(stream).await else {
          return;
        };
        let mut reader = BufReader::new(tls);
        while let Some(request) = read_stub_request(&mut reader).await {
          let response = plain_response("200 OK", "text/plain", request.host.as_bytes());
          if reader.get_mut().write_all(&response).await.is_err() {
            break;
          }
        }
      });
    }
  });

  let (_engine, handle, _dir) = spawn_engine(ProxyConfig::new(".")).await;

  let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
  stream
    .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", origin_addr.port()).as_bytes())
    .await
    .unwrap();
  let mut reader = BufReader::new(stream);
  let mut line = String::new();
  reader.read_line(&mut line).await.unwrap();
  assert!(line.starts_with("HTTP/1.1 200"), "got {line:?}");
  line.clear();
  reader.read_line(&mut line).await.unwrap();
  assert_eq!(line, "\r\n");

  let connector = TlsConnector::from(Arc::new(tapwire::tls::insecure_client_config()));
  let mut tls = connector
    .connect(ServerName::try_from("127.0.0.1").unwrap(), reader.into_inner())
    .await
    .unwrap();

  // The inner Host deliberately disagrees with the CONNECT target.
  tls
    .write_all(b"GET /x HTTP/1.1\r\nHost: spoofed.test\r\n\r\n")
    .await
    .unwrap();
  let response = InboundResponse::read(tls, false, Some(TEST_TIMEOUT)).await.unwrap();
  let (head, body, _) = read_full(response).await;
  assert_eq!(head.status.as_u16(), 200);

  // The origin saw the CONNECT authority, not the client's Host.
  assert_eq!(
    body,
    format!("127.0.0.1:{}", origin_addr.port()).as_bytes()
  );

  handle.stop().await;
}

#[tokio::test]
async fn disabled_interception_means_blind_tunnel() {
  // Raw TCP echo origin: no TLS, no HTTP.
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((mut stream, _)) = listener.accept().await {
      tokio::spawn(async move {
        let mut buf = [0u8; 64];
        while let Ok(n) = stream.read(&mut buf).await {
          if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
            break;
          }
        }
      });
    }
  });

  let (engine, handle, _dir) =
    spawn_engine(ProxyConfig::new(".").with_https(false)).await;

  let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
  stream
    .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", origin_addr.port()).as_bytes())
    .await
    .unwrap();
  let mut reader = BufReader::new(stream);
  let mut line = String::new();
  reader.read_line(&mut line).await.unwrap();
  assert!(line.starts_with("HTTP/1.1 200"));
  line.clear();
  reader.read_line(&mut line).await.unwrap();

  reader.get_mut().write_all(b"opaque-bytes").await.unwrap();
  let mut echo = [0u8; 12];
  tokio::time::timeout(TEST_TIMEOUT, reader.read_exact(&mut echo))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(&echo, b"opaque-bytes");

  // Nothing inside a blind tunnel is recorded.
  assert_eq!(engine.store().count(&TrafficFilter::default()).unwrap(), 0);

  handle.stop().await;
}

#[tokio::test]
async fn shutdown_completes_in_bounded_time_with_a_parked_breakpoint() {
  let origin = spawn_origin(|_| plain_response("200 OK", "text/plain", b"x")).await;
  let (engine, handle, _dir) = spawn_engine(ProxyConfig::new(".")).await;
  let mut events = engine.events().subscribe();

  engine.breakpoints().set_config(BreakpointConfig {
    enabled: true,
    break_on_request: true,
    break_on_response: false,
    url_pattern: None,
  });

  // Park one request at the breakpoint and never answer it.
  let url = format!("http://127.0.0.1:{}/stuck", origin.addr.port());
  let raw = format!("GET {url} HTTP/1.1\r\nHost: h\r\n\r\n").into_bytes();
  let proxy = handle.addr();
  let parked = tokio::spawn(async move {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&raw).await.unwrap();
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf).await;
  });
  loop {
    match tokio::time::timeout(TEST_TIMEOUT, events.recv())
      .await
      .unwrap()
      .unwrap()
    {
      ProxyEvent::BreakpointHit(_) => break,
      _ => continue,
    }
  }

  let started = Instant::now();
  handle.stop().await;
  assert!(
    started.elapsed() < Duration::from_secs(3),
    "stop took {:?}",
    started.elapsed()
  );
  let _ = parked.await;
}

#[tokio::test]
async fn request_rows_expose_lowercased_joined_headers() {
  let origin = spawn_origin(|_| {
    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\nContent-Length: 2\r\n\r\nok"
      .to_vec()
  })
  .await;
  let (engine, handle, _dir) = spawn_engine(ProxyConfig::new(".")).await;
  let mut events = engine.events().subscribe();

  let url = format!("http://127.0.0.1:{}/c", origin.addr.port());
  let raw = format!("GET {url} HTTP/1.1\r\nHost: 127.0.0.1\r\nX-MiXeD: Case\r\n\r\n").into_bytes();
  let _ = request_via_proxy(handle.addr(), raw).await;

  let row = await_complete(&mut events).await;
  assert!(row
    .request_headers
    .iter()
    .any(|(name, value)| name == "x-mixed" && value == "Case"));
  assert!(row
    .response_headers
    .iter()
    .any(|(name, value)| name == "set-cookie" && value == "a=1, b=2"));
  assert!(row.request_headers.iter().all(|(name, _)| name
    .chars()
    .all(|c| !c.is_ascii_uppercase())));

  handle.stop().await;
}
