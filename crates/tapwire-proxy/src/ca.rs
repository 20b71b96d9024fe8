//! Certificate authority and per-host leaf certificates.
//!
//! The engine terminates intercepted TLS with leaf certificates minted on
//! demand under its own CA. The CA keypair persists under the data
//! directory so clients only install it once; leaves live in memory and are
//! memoized per hostname.

use crate::error::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

/// Leaf certificate validity in seconds (1 year).
const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Backdate `not_before` to tolerate client clock skew.
const NOT_BEFORE_OFFSET: i64 = 60;
/// Upper bound on distinct hosts kept in the leaf cache.
const LEAF_CACHE_CAPACITY: u64 = 10_000;

/// A minted leaf: certificate chain (leaf first, CA second) plus its key.
pub struct LeafCert {
  /// Certificate chain in DER form.
  pub chain: Vec<CertificateDer<'static>>,
  /// Private key in DER form.
  pub key: PrivateKeyDer<'static>,
}

impl Clone for LeafCert {
  fn clone(&self) -> Self {
    Self {
      chain: self.chain.clone(),
      key: self.key.clone_key(),
    }
  }
}

/// Mints leaf certificates for hostnames.
///
/// The engine consumes this as an interface so tests can substitute a
/// counting or failing factory.
pub trait CertificateFactory: Send + Sync {
  /// Mint a certificate whose subject covers `host`.
  fn mint(&self, host: &str) -> Result<LeafCert>;
}

/// File-backed certificate authority.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  storage_path: PathBuf,
}

impl CertificateAuthority {
  /// Load the CA from `storage_path`, generating and persisting a fresh one
  /// when none exists.
  pub async fn open(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();
    if !storage_path.exists() {
      fs::create_dir_all(&storage_path).await?;
    }

    let cert_path = storage_path.join("ca_cert.pem");
    let key_path = storage_path.join("ca_key.pem");

    let (issuer, ca_cert_der) = if cert_path.exists() && key_path.exists() {
      Self::load(&cert_path, &key_path).await?
    } else {
      Self::generate(&cert_path, &key_path).await?
    };

    Ok(Self {
      issuer,
      ca_cert_der,
      storage_path,
    })
  }

  async fn load(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path).await?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::certificate(format!("failed to parse CA key: {e}")))?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to load CA certificate: {e}")))?;

    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate("no certificate found in CA PEM"))?
      .map_err(|e| Error::certificate(format!("failed to parse CA PEM: {e}")))?;

    Ok((issuer, cert_der))
  }

  async fn generate(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Tapwire Proxy CA");
    dn.push(DnType::OrganizationName, "Tapwire");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate CA key pair: {e}")))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate(format!("failed to self-sign CA: {e}")))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    let mut cert_file = fs::File::create(cert_path).await?;
    cert_file.write_all(cert_pem.as_bytes()).await?;
    let mut key_file = fs::File::create(key_path).await?;
    key_file.write_all(key_pem.as_bytes()).await?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to build issuer: {e}")))?;

    Ok((issuer, cert_der))
  }

  /// CA certificate in PEM form, for client installation.
  pub fn ca_cert_pem(&self) -> Result<String> {
    std::fs::read_to_string(self.ca_cert_path())
      .map_err(|e| Error::certificate(format!("failed to read CA certificate: {e}")))
  }

  /// Path of the persisted CA certificate.
  pub fn ca_cert_path(&self) -> PathBuf {
    self.storage_path.join("ca_cert.pem")
  }
}

impl CertificateFactory for CertificateAuthority {
  fn mint(&self, host: &str) -> Result<LeafCert> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    // IP literals get both an iPAddress and a dNSName SAN; some clients
    // check one, some the other.
    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = host.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::certificate(format!("invalid hostname: {host}"))
      })?)]
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(LEAF_TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate leaf key pair: {e}")))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate(format!("failed to sign leaf for {host}: {e}")))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate("failed to serialize leaf key"))?;

    Ok(LeafCert {
      chain: vec![cert_der, self.ca_cert_der.clone()],
      key: key_der,
    })
  }
}

/// Memoizing front over a [`CertificateFactory`].
///
/// Leaves are keyed by hostname exactly (no wildcard or SAN expansion);
/// entries are immutable once inserted and live for the engine's lifetime.
#[derive(Clone)]
pub struct CertificateManager {
  factory: Arc<dyn CertificateFactory>,
  cache: Cache<String, Arc<LeafCert>>,
}

impl CertificateManager {
  /// Wrap a factory with a leaf cache.
  pub fn new(factory: Arc<dyn CertificateFactory>) -> Self {
    Self {
      factory,
      cache: Cache::builder().max_capacity(LEAF_CACHE_CAPACITY).build(),
    }
  }

  /// Leaf certificate for `host`, minted on first use.
  pub async fn leaf_for(&self, host: &str) -> Result<Arc<LeafCert>> {
    if let Some(leaf) = self.cache.get(host).await {
      return Ok(leaf);
    }
    let leaf = Arc::new(self.factory.mint(host)?);
    self.cache.insert(host.to_string(), leaf.clone()).await;
    Ok(leaf)
  }

  /// rustls server configuration presenting the leaf for `host`.
  ///
  /// ALPN advertises `http/1.1` only; HTTP/2 is not spoken on the
  /// intercepted leg. Client certificates are never requested.
  pub async fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
    let leaf = self.leaf_for(host).await?;
    let mut config = ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(leaf.chain.clone(), leaf.key.clone_key())
      .map_err(|e| Error::tls(format!("failed to build server config: {e}")))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
  }
}
