//! CLI entrypoint (spec.md §6 "CLI surface", outside the core's tested
//! contract — analogous to the teacher's bare `main`).

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use sniffy::Config;

#[derive(Parser, Debug)]
#[command(name = "sniffy", about = "Intercepting MITM proxy for HTTP, HTTPS and WebSocket traffic")]
struct Cli {
    /// JSON config file; overridden field-by-field by the flags below.
    #[arg(long)]
    config: Option<PathBuf>,
    /// CA store directory. Overrides `ca_store_dir`.
    #[arg(long)]
    store_dir: Option<String>,
    /// Listener bind address. Overrides `address`.
    #[arg(long)]
    address: Option<String>,
    /// Listener port. Overrides `port`.
    #[arg(long)]
    port: Option<u16>,
    /// Directory scanned for shared-object plugins. Overrides `plugins_dir`.
    #[arg(long)]
    plugins_dir: Option<PathBuf>,
    /// Directory holding per-plugin JSON config. Overrides `config_dir`.
    #[arg(long)]
    config_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_or_default(path)?,
        None => Config::default(),
    };

    if let Some(store_dir) = cli.store_dir {
        config.ca_store_dir = store_dir;
    }
    if let Some(address) = cli.address {
        config.address = address;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(plugins_dir) = cli.plugins_dir {
        config.plugins_dir = Some(plugins_dir);
    }
    if let Some(config_dir) = cli.config_dir {
        config.config_dir = Some(config_dir);
    }

    // `logging_enabled` gates info/debug verbosity by adjusting the
    // env-filter default directive; `RUST_LOG` still overrides it if set.
    let default_directive = if config.logging_enabled { "sniffy=debug,info" } else { "warn" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let subscriber = FmtSubscriber::builder().with_env_filter(env_filter).with_target(false).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("installing the default rustls crypto provider");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    sniffy::run(config, shutdown).await?;
    Ok(())
}
