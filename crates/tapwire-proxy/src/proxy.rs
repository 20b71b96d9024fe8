//! Engine assembly and lifecycle.

use crate::breakpoint::BreakpointManager;
use crate::ca::{CertificateAuthority, CertificateFactory, CertificateManager};
use crate::composer::Composer;
use crate::config::ProxyConfig;
use crate::error::Result;
use crate::events::EventBus;
use crate::mock::MockEngine;
use crate::server::{self, ConnectionRegistry, ProxyHandle};
use crate::store::RequestStore;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tapwire::Connector;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

/// The proxy engine: store, mock rules, breakpoints, certificates and the
/// event bus, wired together. Cheap to clone; all clones share state.
///
/// Construction opens the store and the CA eagerly — an unusable data
/// directory is a startup error, not a per-connection one.
#[derive(Clone)]
pub struct ProxyEngine {
  config: ProxyConfig,
  store: RequestStore,
  mocks: MockEngine,
  breakpoints: BreakpointManager,
  certs: CertificateManager,
  events: EventBus,
  connector: Connector,
  ca: Option<Arc<CertificateAuthority>>,
}

impl ProxyEngine {
  /// Build an engine with a file-backed CA under the data directory.
  pub async fn new(config: ProxyConfig) -> Result<Self> {
    let ca = Arc::new(CertificateAuthority::open(config.data_dir.join("ca")).await?);
    let mut engine = Self::assemble(config, ca.clone())?;
    engine.ca = Some(ca);
    Ok(engine)
  }

  /// Build an engine around a custom certificate factory.
  pub fn with_certificate_factory(
    config: ProxyConfig,
    factory: Arc<dyn CertificateFactory>,
  ) -> Result<Self> {
    Self::assemble(config, factory)
  }

  fn assemble(config: ProxyConfig, factory: Arc<dyn CertificateFactory>) -> Result<Self> {
    let store = RequestStore::open(&config.data_dir)?;
    let mocks = MockEngine::load(store.clone())?;
    let events = EventBus::new();
    let breakpoints = BreakpointManager::new(events.clone());
    Ok(Self {
      config,
      store,
      mocks,
      breakpoints,
      certs: CertificateManager::new(factory),
      events,
      connector: Connector::new(Duration::from_secs(10)),
      ca: None,
    })
  }

  /// Engine configuration.
  pub fn config(&self) -> &ProxyConfig {
    &self.config
  }

  /// The traffic store.
  pub fn store(&self) -> &RequestStore {
    &self.store
  }

  /// The mock rule engine.
  pub fn mocks(&self) -> &MockEngine {
    &self.mocks
  }

  /// The breakpoint rendezvous.
  pub fn breakpoints(&self) -> &BreakpointManager {
    &self.breakpoints
  }

  /// The event bus.
  pub fn events(&self) -> &EventBus {
    &self.events
  }

  pub(crate) fn certs(&self) -> &CertificateManager {
    &self.certs
  }

  pub(crate) fn connector(&self) -> &Connector {
    &self.connector
  }

  /// A composer sharing this engine's store and capture policy.
  pub fn composer(&self) -> Composer {
    Composer::new(
      self.store.clone(),
      self.connector.clone(),
      self.config.max_request_body_size,
      self.config.max_response_body_size,
    )
  }

  /// CA certificate PEM for client installation. Errors when the engine
  /// was built around a custom factory with no file-backed CA.
  pub fn ca_cert_pem(&self) -> Result<String> {
    match &self.ca {
      Some(ca) => ca.ca_cert_pem(),
      None => Err(crate::Error::Certificate(
        "engine has no file-backed CA".into(),
      )),
    }
  }

  /// Bind the listener and start serving. Bind failures (port in use)
  /// surface here.
  pub async fn start(&self) -> Result<ProxyHandle> {
    let listener =
      TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.config.port)).await?;
    let addr = listener.local_addr()?;
    info!("proxy listening on {addr}");

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let registry = ConnectionRegistry::new();
    let accept_task = tokio::spawn(server::run(
      self.clone(),
      listener,
      registry.clone(),
      shutdown_rx,
    ));

    Ok(ProxyHandle::new(
      addr,
      shutdown_tx,
      accept_task,
      registry,
      self.breakpoints.clone(),
    ))
  }
}
