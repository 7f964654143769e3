//! sniffy: an intercepting MITM proxy for HTTP, HTTPS, and WebSocket
//! traffic, forging per-host TLS certificates off a locally generated root
//! CA and exposing decrypted exchanges to a pluggable hook pipeline
//! (spec.md §1).

pub mod acceptor;
pub mod ca;
pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod plugin;
pub mod protocol;
pub mod service;
pub mod ws;

pub use config::Config;
pub use error::ProxyError;

use std::sync::Arc;

use tracing::info;

use crate::acceptor::Acceptor;
use crate::protocol::Registry;
use crate::service::Services;

/// Builds the shared services, the default protocol registry, and runs the
/// acceptor until `shutdown` resolves.
pub async fn run(config: Config, shutdown: impl std::future::Future<Output = ()>) -> Result<(), ProxyError> {
    let services = Services::bootstrap(config).await?;
    let registry = Arc::new(Registry::with_defaults());
    let acceptor = Arc::new(Acceptor::new(services.clone(), registry));

    acceptor.start().await?;
    info!("acceptor started");

    shutdown.await;
    info!("shutdown signal received, stopping acceptor");
    acceptor.stop().await;

    Ok(())
}
