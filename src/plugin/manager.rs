//! Plugin loading and the four priority-sorted hook views (spec.md §4.6
//! "Manager").
//!
//! Only factory plugins (registered in-process by name) are implemented;
//! shared-object discovery is an explicitly optional capability (spec.md §9
//! "Implementations may omit it and use only factory plugins") and is left
//! out here — the executor's contract is unaffected by which source a
//! plugin came from.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::ProxyError;
use crate::plugin::api::PluginApi;
use crate::plugin::{ConnectionInterceptor, Plugin, PluginMetadata, PluginState, RequestInterceptor, ResponseInterceptor, WsInterceptor};

const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PluginConfigFile {
    enabled: bool,
    priority: i32,
    settings: Value,
    whitelist: Vec<String>,
    blacklist: Vec<String>,
}

impl Default for PluginConfigFile {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: 0,
            settings: Value::Object(serde_json::Map::new()),
            whitelist: Vec::new(),
            blacklist: Vec::new(),
        }
    }
}

pub struct LoadedPlugin {
    pub plugin: Arc<dyn Plugin>,
    pub metadata: PluginMetadata,
    pub priority: i32,
    pub enabled: bool,
    pub settings: Value,
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
}

/// Holds the loaded-plugin map and the four phase-ordered views (spec.md §3
/// "four priority-sorted views"), plus the data/metrics maps `PluginApi`
/// exposes.
pub struct PluginManager {
    config: Arc<Config>,
    config_dir: Option<PathBuf>,
    pending: RwLock<Vec<Arc<dyn Plugin>>>,
    plugins: RwLock<HashMap<String, Arc<LoadedPlugin>>>,
    request_order: RwLock<Vec<Arc<LoadedPlugin>>>,
    response_order: RwLock<Vec<Arc<LoadedPlugin>>>,
    connection_order: RwLock<Vec<Arc<LoadedPlugin>>>,
    ws_order: RwLock<Vec<Arc<LoadedPlugin>>>,
    data_store: RwLock<HashMap<String, Value>>,
    metrics: RwLock<HashMap<String, f64>>,
}

impl PluginManager {
    pub fn new(config: Arc<Config>) -> Self {
        let config_dir = config.config_dir.clone();
        Self {
            config,
            config_dir,
            pending: RwLock::new(Vec::new()),
            plugins: RwLock::new(HashMap::new()),
            request_order: RwLock::new(Vec::new()),
            response_order: RwLock::new(Vec::new()),
            connection_order: RwLock::new(Vec::new()),
            ws_order: RwLock::new(Vec::new()),
            data_store: RwLock::new(HashMap::new()),
            metrics: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_factory(&self, plugin: Arc<dyn Plugin>) {
        self.pending.write().push(plugin);
    }

    fn read_plugin_config(&self, name: &str) -> PluginConfigFile {
        let Some(dir) = &self.config_dir else {
            return PluginConfigFile::default();
        };
        let path = dir.join(format!("{name}.json"));
        match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(plugin = name, error = %e, "plugin config invalid, using defaults");
                PluginConfigFile::default()
            }),
            Err(_) => PluginConfigFile::default(),
        }
    }

    /// Initializes every registered-but-not-yet-loaded plugin with a
    /// timeout, then rebuilds the sorted phase views (spec.md §4.6
    /// "LoadPlugins").
    pub async fn load_plugins(self: &Arc<Self>) -> Result<(), ProxyError> {
        let pending: Vec<Arc<dyn Plugin>> = self.pending.write().drain(..).collect();
        let api: Arc<dyn PluginApi> = self.clone();

        let mut loaded = self.plugins.write();
        for plugin in pending {
            let metadata = plugin.metadata();
            let file_config = self.read_plugin_config(&metadata.name);

            match tokio::time::timeout(DEFAULT_INIT_TIMEOUT, plugin.init(api.clone())).await {
                Ok(Ok(())) => {
                    info!(plugin = %metadata.name, "plugin initialized");
                    loaded.insert(
                        metadata.name.clone(),
                        Arc::new(LoadedPlugin {
                            plugin,
                            metadata,
                            priority: file_config.priority,
                            enabled: file_config.enabled,
                            settings: file_config.settings,
                            whitelist: file_config.whitelist,
                            blacklist: file_config.blacklist,
                        }),
                    );
                }
                Ok(Err(e)) => error!(plugin = %metadata.name, error = %e, "plugin init failed, not loaded"),
                Err(_) => error!(plugin = %metadata.name, "plugin init timed out, not loaded"),
            }
        }
        drop(loaded);

        self.rebuild_views();
        Ok(())
    }

    fn rebuild_views(&self) {
        let all: Vec<Arc<LoadedPlugin>> = self.plugins.read().values().cloned().collect();

        let mut requests: Vec<Arc<LoadedPlugin>> =
            all.iter().filter(|p| p.plugin.clone().as_request_interceptor().is_some()).cloned().collect();
        let mut responses: Vec<Arc<LoadedPlugin>> =
            all.iter().filter(|p| p.plugin.clone().as_response_interceptor().is_some()).cloned().collect();
        let mut connections: Vec<Arc<LoadedPlugin>> =
            all.iter().filter(|p| p.plugin.clone().as_connection_interceptor().is_some()).cloned().collect();
        let mut ws: Vec<Arc<LoadedPlugin>> =
            all.iter().filter(|p| p.plugin.clone().as_ws_interceptor().is_some()).cloned().collect();

        for list in [&mut requests, &mut responses, &mut connections, &mut ws] {
            list.sort_by_key(|p| p.priority);
        }

        *self.request_order.write() = requests;
        *self.response_order.write() = responses;
        *self.connection_order.write() = connections;
        *self.ws_order.write() = ws;
    }

    pub fn request_interceptors(&self) -> Vec<Arc<LoadedPlugin>> {
        self.request_order.read().clone()
    }

    pub fn response_interceptors(&self) -> Vec<Arc<LoadedPlugin>> {
        self.response_order.read().clone()
    }

    pub fn connection_interceptors(&self) -> Vec<Arc<LoadedPlugin>> {
        self.connection_order.read().clone()
    }

    pub fn ws_interceptors(&self) -> Vec<Arc<LoadedPlugin>> {
        self.ws_order.read().clone()
    }

    /// Increments a named counter (spec.md's Metrics snapshot: per-plugin
    /// requests/responses/blocked counts), creating it at zero on first use.
    pub fn record_metric(&self, key: &str, delta: f64) {
        *self.metrics.write().entry(key.to_string()).or_insert(0.0) += delta;
    }

    /// Watches `config_dir` for changes and re-reads every loaded plugin's
    /// JSON config when the directory settles (spec.md §6 "enable_hot_reload
    /// + watch_interval"). A no-op unless hot reload is enabled and a config
    /// directory is set; runs on its own thread since file re-reads and view
    /// rebuilding are synchronous work.
    pub fn spawn_hot_reload(self: &Arc<Self>) {
        if !self.config.enable_hot_reload {
            return;
        }
        let Some(dir) = self.config_dir.clone() else {
            return;
        };
        let interval = Duration::from_millis(self.config.watch_interval_ms.max(100));
        let manager = self.clone();

        std::thread::spawn(move || {
            let (tx, rx) = std::sync::mpsc::channel::<notify::Result<notify::Event>>();
            let mut watcher = match notify::recommended_watcher(move |event| {
                let _ = tx.send(event);
            }) {
                Ok(w) => w,
                Err(e) => {
                    error!(error = %e, "could not start plugin config watcher");
                    return;
                }
            };

            if let Err(e) = notify::Watcher::watch(&mut watcher, &dir, notify::RecursiveMode::NonRecursive) {
                error!(error = %e, dir = %dir.display(), "could not watch plugin config directory");
                return;
            }

            while let Ok(event) = rx.recv() {
                match event {
                    Ok(_) => {
                        std::thread::sleep(interval);
                        while rx.try_recv().is_ok() {}
                        manager.reload_plugin_configs();
                    }
                    Err(e) => warn!(error = %e, "plugin config watch error"),
                }
            }
        });
    }

    /// Re-reads every loaded plugin's on-disk config and rebuilds the
    /// priority views, without re-initializing or restarting any plugin.
    fn reload_plugin_configs(&self) {
        let names: Vec<String> = self.plugins.read().keys().cloned().collect();
        {
            let mut plugins = self.plugins.write();
            for name in names {
                let Some(existing) = plugins.get(&name).cloned() else { continue };
                let file_config = self.read_plugin_config(&name);
                plugins.insert(
                    name,
                    Arc::new(LoadedPlugin {
                        plugin: existing.plugin.clone(),
                        metadata: existing.metadata.clone(),
                        priority: file_config.priority,
                        enabled: file_config.enabled,
                        settings: file_config.settings,
                        whitelist: file_config.whitelist,
                        blacklist: file_config.blacklist,
                    }),
                );
            }
        }
        self.rebuild_views();
        info!("reloaded plugin configuration from disk");
    }

    /// Starts every loaded plugin in parallel; a plugin's failure is logged
    /// and does not stop the others (spec.md §4.6 "fan out in parallel and
    /// log per-plugin errors without aborting").
    pub async fn start_plugins(&self) {
        self.fan_out("start", PluginState::Started, |p| {
            let plugin = p.plugin.clone();
            Box::pin(async move { plugin.start().await })
        })
        .await;
    }

    pub async fn stop_plugins(&self) {
        self.fan_out("stop", PluginState::Stopped, |p| {
            let plugin = p.plugin.clone();
            Box::pin(async move { plugin.stop().await })
        })
        .await;
    }

    async fn fan_out<F>(&self, action: &str, _target_state: PluginState, make_future: F)
    where
        F: Fn(&Arc<LoadedPlugin>) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), ProxyError>> + Send>>,
    {
        let plugins: Vec<Arc<LoadedPlugin>> = self.plugins.read().values().cloned().collect();
        let futures = plugins.iter().map(|p| {
            let name = p.metadata.name.clone();
            let fut = make_future(p);
            async move {
                if let Err(e) = fut.await {
                    error!(plugin = name, action, error = %e, "plugin lifecycle call failed");
                }
            }
        });
        futures::future::join_all(futures).await;
    }
}

impl PluginApi for PluginManager {
    fn get_logger(&self, name: &str) -> tracing::Span {
        crate::plugin::api::plugin_span(name)
    }

    fn get_config(&self) -> Arc<Config> {
        self.config.clone()
    }

    fn send_notification(&self, title: &str, message: &str) {
        crate::plugin::api::log_notification(title, message);
    }

    fn get_metrics(&self) -> HashMap<String, f64> {
        self.metrics.read().clone()
    }

    fn store_data(&self, key: &str, value: Value) {
        self.data_store.write().insert(key.to_string(), value);
    }

    fn get_data(&self, key: &str) -> Option<Value> {
        self.data_store.read().get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::context::{InterceptContext, InterceptResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPlugin {
        name: &'static str,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Plugin for CountingPlugin {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata {
                name: self.name.to_string(),
                version: "0.1.0".to_string(),
                category: "test".to_string(),
            }
        }

        async fn init(&self, _api: Arc<dyn PluginApi>) -> Result<(), ProxyError> {
            Ok(())
        }

        fn as_request_interceptor(self: Arc<Self>) -> Option<Arc<dyn RequestInterceptor>> {
            Some(self)
        }
    }

    #[async_trait]
    impl RequestInterceptor for CountingPlugin {
        async fn on_request(&self, _ctx: &mut InterceptContext) -> InterceptResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            InterceptResult::proceed()
        }
    }

    #[tokio::test]
    async fn load_plugins_populates_request_view() {
        let manager = Arc::new(PluginManager::new(Arc::new(Config::default())));
        let calls = Arc::new(AtomicUsize::new(0));
        manager.register_factory(Arc::new(CountingPlugin { name: "counter", calls }));
        manager.load_plugins().await.unwrap();

        let view = manager.request_interceptors();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].metadata.name, "counter");
    }

    #[tokio::test]
    async fn reload_plugin_configs_picks_up_edited_priority_and_enabled() {
        let dir = std::env::temp_dir().join(format!("sniffy-hotreload-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("counter.json"), r#"{"enabled": true, "priority": 5}"#).unwrap();

        let mut config = Config::default();
        config.config_dir = Some(dir.clone());
        let manager = Arc::new(PluginManager::new(Arc::new(config)));
        let calls = Arc::new(AtomicUsize::new(0));
        manager.register_factory(Arc::new(CountingPlugin { name: "counter", calls }));
        manager.load_plugins().await.unwrap();
        assert_eq!(manager.request_interceptors()[0].priority, 5);

        std::fs::write(dir.join("counter.json"), r#"{"enabled": false, "priority": 99}"#).unwrap();
        manager.reload_plugin_configs();

        let reloaded = manager.plugins.read().get("counter").cloned().unwrap();
        assert_eq!(reloaded.priority, 99);
        assert!(!reloaded.enabled);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn record_metric_accumulates_under_the_same_key() {
        let manager = PluginManager::new(Arc::new(Config::default()));
        manager.record_metric("counter.requests", 1.0);
        manager.record_metric("counter.requests", 1.0);
        manager.record_metric("counter.blocked", 1.0);

        let metrics = manager.get_metrics();
        assert_eq!(metrics.get("counter.requests"), Some(&2.0));
        assert_eq!(metrics.get("counter.blocked"), Some(&1.0));
    }
}
