//! The host surface exposed to plugins (spec.md §6 "Plugin API exposed to
//! plugins").

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::config::Config;

/// Minimum surface a plugin gets handed at `init` time. Implemented by
/// `PluginManager`, which owns the data/metrics maps this trait reads and
/// writes.
pub trait PluginApi: Send + Sync {
    fn get_logger(&self, name: &str) -> tracing::Span;
    fn get_config(&self) -> Arc<Config>;
    fn send_notification(&self, title: &str, message: &str);
    fn get_metrics(&self) -> HashMap<String, f64>;
    fn store_data(&self, key: &str, value: Value);
    fn get_data(&self, key: &str) -> Option<Value>;
}

/// A minimal notification sink: logs at info level. Real delivery (desktop
/// notifications, webhooks) is a UI-layer concern outside this core.
pub fn log_notification(title: &str, message: &str) {
    info!(title, message, "plugin notification");
}

pub fn plugin_span(name: &str) -> tracing::Span {
    tracing::info_span!("plugin", name)
}
