//! Engine configuration.

use crate::DEFAULT_PROXY_PORT;
use std::path::PathBuf;

/// Default cap on buffered request bodies kept for storage (1 MiB).
pub const DEFAULT_MAX_REQUEST_BODY: usize = 1024 * 1024;
/// Default cap on the stored copy of response bodies (5 MiB).
pub const DEFAULT_MAX_RESPONSE_BODY: usize = 5 * 1024 * 1024;

/// Proxy engine configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
  /// Listening port, bound on all interfaces.
  pub port: u16,
  /// Advertised host, informational only (shown to UIs, QR codes, logs).
  pub host: String,
  /// Terminate and re-encrypt CONNECT tunnels. When false, CONNECT becomes
  /// a blind byte tunnel and nothing inside it is recorded.
  pub enable_https: bool,
  /// Directory owning persistent state: `data/traffic.db` and the CA
  /// material under `ca/`.
  pub data_dir: PathBuf,
  /// Stored request bodies above this many bytes become a placeholder. The
  /// full body is still forwarded to the origin.
  pub max_request_body_size: usize,
  /// Stored response bodies above this many bytes become a placeholder.
  /// The client always receives the full body.
  pub max_response_body_size: usize,
}

impl ProxyConfig {
  /// Configuration with defaults, rooted at `data_dir`.
  pub fn new(data_dir: impl Into<PathBuf>) -> Self {
    Self {
      port: DEFAULT_PROXY_PORT,
      host: "0.0.0.0".to_string(),
      enable_https: true,
      data_dir: data_dir.into(),
      max_request_body_size: DEFAULT_MAX_REQUEST_BODY,
      max_response_body_size: DEFAULT_MAX_RESPONSE_BODY,
    }
  }

  /// Set the listening port.
  pub fn with_port(mut self, port: u16) -> Self {
    self.port = port;
    self
  }

  /// Set the advertised host name.
  pub fn with_host(mut self, host: impl Into<String>) -> Self {
    self.host = host.into();
    self
  }

  /// Enable or disable HTTPS interception.
  pub fn with_https(mut self, enable: bool) -> Self {
    self.enable_https = enable;
    self
  }

  /// Set the stored-request-body cap.
  pub fn with_max_request_body(mut self, bytes: usize) -> Self {
    self.max_request_body_size = bytes;
    self
  }

  /// Set the stored-response-body cap.
  pub fn with_max_response_body(mut self, bytes: usize) -> Self {
    self.max_response_body_size = bytes;
    self
  }
}
