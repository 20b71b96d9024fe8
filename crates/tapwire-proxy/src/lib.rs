//! Intercepting HTTP/HTTPS proxy engine.
//!
//! The engine sits between configured clients and origin servers, records
//! every exchange into a SQLite-backed store, and exposes two live-traffic
//! primitives: mock rules (synthetic responses matched by URL pattern) and
//! breakpoints (pause, edit, resume of in-flight messages).
//!
//! ```no_run
//! use tapwire_proxy::{ProxyConfig, ProxyEngine};
//!
//! # async fn run() -> tapwire_proxy::Result<()> {
//! let engine = ProxyEngine::new(ProxyConfig::new("/tmp/tapwire").with_port(8888)).await?;
//! let handle = engine.start().await?;
//! println!("proxy listening on {}", handle.addr());
//! handle.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! HTTPS interception terminates the client's TLS with a per-host leaf
//! certificate minted under the engine's CA; install the CA certificate from
//! [`ProxyEngine::ca_cert_pem`] on the client device. With interception
//! disabled, `CONNECT` becomes a blind byte tunnel.

mod breakpoint;
mod ca;
mod capture;
mod composer;
mod config;
mod error;
mod events;
mod handler;
mod inbound;
mod mitm;
mod mock;
mod proxy;
mod server;
pub mod store;

pub use breakpoint::{
  BreakpointConfig, BreakpointManager, Direction, InterceptedMessage,
};
pub use ca::{CertificateAuthority, CertificateFactory, CertificateManager, LeafCert};
pub use composer::{ComposedRequest, Composer};
pub use config::ProxyConfig;
pub use error::{Error, Result};
pub use events::{EventBus, ProxyEvent};
pub use mock::{MockEngine, MockResponse};
pub use proxy::ProxyEngine;
pub use server::ProxyHandle;
pub use store::{CapturedExchange, MockRule, NewMockRule, RequestStore, TrafficFilter};

/// Default listening port.
pub const DEFAULT_PROXY_PORT: u16 = 8888;
