//! Process-wide service locator: config, CA, upstream client and plugin
//! manager, shared by every accepted connection (spec.md §1 "Core",
//! assembled once and handed to every `Processor`).

use std::sync::Arc;

use tracing::{info, warn};

use crate::ca::CertificateAuthority;
use crate::config::Config;
use crate::error::ProxyError;
use crate::http::client::UpstreamClient;
use crate::plugin::manager::PluginManager;

pub struct Services {
    pub config: Arc<Config>,
    pub ca: Arc<CertificateAuthority>,
    pub upstream: Arc<UpstreamClient>,
    pub plugins: Arc<PluginManager>,
}

impl Services {
    /// Builds the CA (always persistent; an empty `ca_store_dir` resolves to
    /// `$HOME/.sniffy/` per spec.md §6 "Store path resolution", not to an
    /// in-memory CA), the pooled upstream client, and the plugin manager,
    /// then loads and starts whatever plugins were registered before this
    /// call if `config.auto_load` is set.
    pub async fn bootstrap(config: Config) -> Result<Arc<Self>, ProxyError> {
        let config = Arc::new(config);

        let ca = CertificateAuthority::persistent(&config.ca_store_dir)?;

        let upstream = UpstreamClient::new()?;
        let plugins = Arc::new(PluginManager::new(config.clone()));

        let services = Arc::new(Self {
            config: config.clone(),
            ca: Arc::new(ca),
            upstream: Arc::new(upstream),
            plugins,
        });

        if config.auto_load {
            services.plugins.load_plugins().await?;
            services.plugins.start_plugins().await;
            services.plugins.spawn_hot_reload();
            info!("plugins loaded and started");
        } else {
            warn!("auto_load disabled; registered plugins were not initialized");
        }

        Ok(services)
    }
}
