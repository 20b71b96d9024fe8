//! Minimal recording proxy.
//!
//! ```bash
//! cargo run --example record_proxy
//! # then configure a client to use http://127.0.0.1:8888 and install the
//! # CA certificate printed below
//! ```

use tapwire_proxy::{ProxyConfig, ProxyEngine, ProxyEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tapwire_proxy=debug".into()),
    )
    .init();

  let config = ProxyConfig::new("./tapwire-data").with_port(8888);
  let engine = ProxyEngine::new(config).await?;

  println!("install this CA certificate on your client device:\n");
  println!("{}", engine.ca_cert_pem()?);

  let mut events = engine.events().subscribe();
  tokio::spawn(async move {
    while let Ok(event) = events.recv().await {
      if let ProxyEvent::RequestComplete(row) = event {
        println!("{} {} -> {} ({} bytes)", row.method, row.url, row.status, row.size);
      }
    }
  });

  let handle = engine.start().await?;
  println!("proxy listening on {}", handle.addr());

  tokio::signal::ctrl_c().await?;
  handle.stop().await;
  Ok(())
}
