//! Hook execution (spec.md §4.6 "Executor"): walks a phase's
//! priority-ordered plugin list, applies access control, and isolates each
//! hook behind a panic guard so one misbehaving plugin cannot take the
//! connection down with it.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tracing::error;

use crate::plugin::access_allowed;
use crate::plugin::context::{InterceptContext, InterceptResult};
use crate::plugin::manager::PluginManager;

async fn guarded<F>(plugin_name: &str, fut: F) -> InterceptResult
where
    F: std::future::Future<Output = InterceptResult>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            error!(plugin = plugin_name, "plugin hook panicked, treating as pass-through");
            InterceptResult::proceed()
        }
    }
}

async fn guarded_unit<F>(plugin_name: &str, fut: F)
where
    F: std::future::Future<Output = ()>,
{
    if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
        error!(plugin = plugin_name, "plugin lifecycle hook panicked");
    }
}

/// Runs the request-intercept phase. A hook returning `continue = false`
/// stops the chain; `modified` accumulates across every hook that ran.
pub async fn run_request_hooks(manager: &PluginManager, ctx: &mut InterceptContext) -> InterceptResult {
    let mut modified = false;
    for loaded in manager.request_interceptors() {
        if !loaded.enabled || !access_allowed(&loaded.whitelist, &loaded.blacklist, &ctx.match_target()) {
            continue;
        }
        let interceptor = loaded
            .plugin
            .clone()
            .as_request_interceptor()
            .expect("request_interceptors() only yields plugins with a request interceptor");
        let result = guarded(&loaded.metadata.name, interceptor.on_request(ctx)).await;
        manager.record_metric(&format!("{}.requests", loaded.metadata.name), 1.0);
        modified |= result.modified;
        if !result.r#continue {
            manager.record_metric(&format!("{}.blocked", loaded.metadata.name), 1.0);
            return InterceptResult { modified, ..result };
        }
    }
    InterceptResult { modified, ..InterceptResult::proceed() }
}

pub async fn run_response_hooks(manager: &PluginManager, ctx: &mut InterceptContext) -> InterceptResult {
    let mut modified = false;
    for loaded in manager.response_interceptors() {
        if !loaded.enabled || !access_allowed(&loaded.whitelist, &loaded.blacklist, &ctx.match_target()) {
            continue;
        }
        let interceptor = loaded
            .plugin
            .clone()
            .as_response_interceptor()
            .expect("response_interceptors() only yields plugins with a response interceptor");
        let result = guarded(&loaded.metadata.name, interceptor.on_response(ctx)).await;
        manager.record_metric(&format!("{}.responses", loaded.metadata.name), 1.0);
        modified |= result.modified;
        if !result.r#continue {
            manager.record_metric(&format!("{}.blocked", loaded.metadata.name), 1.0);
            return InterceptResult { modified, ..result };
        }
    }
    InterceptResult { modified, ..InterceptResult::proceed() }
}

/// Runs the websocket-message phase, identical shape to the request/response
/// phases but keyed on `ctx.direction` rather than a URI.
pub async fn run_ws_hooks(manager: &PluginManager, ctx: &mut InterceptContext) -> InterceptResult {
    let mut modified = false;
    for loaded in manager.ws_interceptors() {
        if !loaded.enabled {
            continue;
        }
        let interceptor = loaded
            .plugin
            .clone()
            .as_ws_interceptor()
            .expect("ws_interceptors() only yields plugins with a ws interceptor");
        let result = guarded(&loaded.metadata.name, interceptor.on_message(ctx)).await;
        modified |= result.modified;
        if !result.r#continue {
            return InterceptResult { modified, ..result };
        }
    }
    InterceptResult { modified, ..InterceptResult::proceed() }
}

/// Connection lifecycle hooks have no verdict to accumulate; every
/// registered plugin runs regardless of what the others reported.
pub async fn run_connection_start_hooks(manager: &PluginManager, ctx: &mut InterceptContext) {
    for loaded in manager.connection_interceptors() {
        if !loaded.enabled {
            continue;
        }
        let interceptor = loaded
            .plugin
            .clone()
            .as_connection_interceptor()
            .expect("connection_interceptors() only yields plugins with a connection interceptor");
        guarded_unit(&loaded.metadata.name, interceptor.on_connection_start(ctx)).await;
    }
}

pub async fn run_connection_end_hooks(manager: &PluginManager, ctx: &mut InterceptContext, duration: Duration) {
    for loaded in manager.connection_interceptors() {
        if !loaded.enabled {
            continue;
        }
        let interceptor = loaded
            .plugin
            .clone()
            .as_connection_interceptor()
            .expect("connection_interceptors() only yields plugins with a connection interceptor");
        guarded_unit(&loaded.metadata.name, interceptor.on_connection_end(ctx, duration)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::ProxyError;
    use crate::plugin::api::PluginApi;
    use crate::plugin::{Plugin, PluginMetadata, RequestInterceptor};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct PanicPlugin;

    #[async_trait]
    impl Plugin for PanicPlugin {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata { name: "panicker".to_string(), version: "0.1.0".to_string(), category: "test".to_string() }
        }
        async fn init(&self, _api: Arc<dyn PluginApi>) -> Result<(), ProxyError> {
            Ok(())
        }
        fn as_request_interceptor(self: Arc<Self>) -> Option<Arc<dyn RequestInterceptor>> {
            Some(self)
        }
    }

    #[async_trait]
    impl RequestInterceptor for PanicPlugin {
        async fn on_request(&self, _ctx: &mut InterceptContext) -> InterceptResult {
            panic!("boom");
        }
    }

    struct BlockingPlugin;

    #[async_trait]
    impl Plugin for BlockingPlugin {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata { name: "blocker".to_string(), version: "0.1.0".to_string(), category: "test".to_string() }
        }
        async fn init(&self, _api: Arc<dyn PluginApi>) -> Result<(), ProxyError> {
            Ok(())
        }
        fn as_request_interceptor(self: Arc<Self>) -> Option<Arc<dyn RequestInterceptor>> {
            Some(self)
        }
    }

    #[async_trait]
    impl RequestInterceptor for BlockingPlugin {
        async fn on_request(&self, _ctx: &mut InterceptContext) -> InterceptResult {
            InterceptResult::block("denied by policy")
        }
    }

    fn request_ctx() -> InterceptContext {
        let req = http::Request::builder().uri("http://example.com/").body(bytes::Bytes::new()).unwrap();
        InterceptContext::for_request("conn-1".to_string(), req)
    }

    #[tokio::test]
    async fn panicking_plugin_does_not_abort_the_chain() {
        let manager = Arc::new(PluginManager::new(Arc::new(Config::default())));
        manager.register_factory(Arc::new(PanicPlugin));
        manager.load_plugins().await.unwrap();

        let mut ctx = request_ctx();
        let result = run_request_hooks(&manager, &mut ctx).await;
        assert!(result.r#continue);
    }

    #[tokio::test]
    async fn blocking_plugin_stops_the_chain() {
        let manager = Arc::new(PluginManager::new(Arc::new(Config::default())));
        manager.register_factory(Arc::new(BlockingPlugin));
        manager.load_plugins().await.unwrap();

        let mut ctx = request_ctx();
        let result = run_request_hooks(&manager, &mut ctx).await;
        assert!(!result.r#continue);
        assert_eq!(result.message.as_deref(), Some("denied by policy"));
    }

    struct OrderRecordingPlugin {
        name: &'static str,
        order: Arc<parking_lot::Mutex<Vec<&'static str>>>,
        block: bool,
    }

    #[async_trait]
    impl Plugin for OrderRecordingPlugin {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata { name: self.name.to_string(), version: "0.1.0".to_string(), category: "test".to_string() }
        }
        async fn init(&self, _api: Arc<dyn PluginApi>) -> Result<(), ProxyError> {
            Ok(())
        }
        fn as_request_interceptor(self: Arc<Self>) -> Option<Arc<dyn RequestInterceptor>> {
            Some(self)
        }
    }

    #[async_trait]
    impl RequestInterceptor for OrderRecordingPlugin {
        async fn on_request(&self, _ctx: &mut InterceptContext) -> InterceptResult {
            self.order.lock().push(self.name);
            if self.block {
                InterceptResult::block("stopped at this priority")
            } else {
                InterceptResult::proceed()
            }
        }
    }

    fn write_plugin_config(dir: &std::path::Path, name: &str, priority: i32) {
        let body = format!(r#"{{"enabled": true, "priority": {priority}}}"#);
        std::fs::write(dir.join(format!("{name}.json")), body).unwrap();
    }

    /// spec.md §4.6 property P6: hooks run in ascending-priority order, and a
    /// `continue = false` from an earlier-priority hook prevents every
    /// later-priority hook from running at all.
    #[tokio::test]
    async fn hooks_run_in_ascending_priority_order_and_stop_the_chain() {
        let dir = std::env::temp_dir().join(format!("sniffy-plugin-order-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        write_plugin_config(&dir, "low", 10);
        write_plugin_config(&dir, "high", 20);

        let mut config = Config::default();
        config.config_dir = Some(dir.clone());
        let manager = Arc::new(PluginManager::new(Arc::new(config)));

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        manager.register_factory(Arc::new(OrderRecordingPlugin { name: "high", order: order.clone(), block: false }));
        manager.register_factory(Arc::new(OrderRecordingPlugin { name: "low", order: order.clone(), block: false }));
        manager.load_plugins().await.unwrap();

        let mut ctx = request_ctx();
        let result = run_request_hooks(&manager, &mut ctx).await;
        assert!(result.r#continue);
        assert_eq!(*order.lock(), vec!["low", "high"]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn a_blocking_hook_prevents_lower_priority_hooks_from_running() {
        let dir = std::env::temp_dir().join(format!("sniffy-plugin-order-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        write_plugin_config(&dir, "first", 10);
        write_plugin_config(&dir, "second", 20);

        let mut config = Config::default();
        config.config_dir = Some(dir.clone());
        let manager = Arc::new(PluginManager::new(Arc::new(config)));

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        manager.register_factory(Arc::new(OrderRecordingPlugin { name: "second", order: order.clone(), block: false }));
        manager.register_factory(Arc::new(OrderRecordingPlugin { name: "first", order: order.clone(), block: true }));
        manager.load_plugins().await.unwrap();

        let mut ctx = request_ctx();
        let result = run_request_hooks(&manager, &mut ctx).await;
        assert!(!result.r#continue);
        assert_eq!(*order.lock(), vec!["first"]);

        std::fs::remove_dir_all(&dir).ok();
    }
}
