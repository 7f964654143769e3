//! Plugin trait, metadata, lifecycle, and the manager/executor that load and
//! run them (spec.md §3 "Plugin", §4.6).

pub mod api;
pub mod context;
pub mod executor;
pub mod manager;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProxyError;
use crate::plugin::api::PluginApi;
use crate::plugin::context::{InterceptContext, InterceptResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Loaded,
    Initialized,
    Started,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    pub category: String,
}

/// A loaded plugin. Implementors declare any subset of the four capability
/// traits below by overriding the corresponding `as_*` method (default
/// `None`), matching spec.md §3 "Plugins may declare any subset of four
/// capabilities".
#[async_trait]
pub trait Plugin: Send + Sync {
    fn metadata(&self) -> PluginMetadata;

    async fn init(&self, api: Arc<dyn PluginApi>) -> Result<(), ProxyError>;
    async fn start(&self) -> Result<(), ProxyError> {
        Ok(())
    }
    async fn stop(&self) -> Result<(), ProxyError> {
        Ok(())
    }

    fn as_request_interceptor(self: Arc<Self>) -> Option<Arc<dyn RequestInterceptor>> {
        None
    }
    fn as_response_interceptor(self: Arc<Self>) -> Option<Arc<dyn ResponseInterceptor>> {
        None
    }
    fn as_connection_interceptor(self: Arc<Self>) -> Option<Arc<dyn ConnectionInterceptor>> {
        None
    }
    fn as_ws_interceptor(self: Arc<Self>) -> Option<Arc<dyn WsInterceptor>> {
        None
    }
}

#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    async fn on_request(&self, ctx: &mut InterceptContext) -> InterceptResult;
}

#[async_trait]
pub trait ResponseInterceptor: Send + Sync {
    async fn on_response(&self, ctx: &mut InterceptContext) -> InterceptResult;
}

#[async_trait]
pub trait ConnectionInterceptor: Send + Sync {
    async fn on_connection_start(&self, ctx: &mut InterceptContext);
    async fn on_connection_end(&self, ctx: &mut InterceptContext, duration: std::time::Duration);
}

#[async_trait]
pub trait WsInterceptor: Send + Sync {
    async fn on_message(&self, ctx: &mut InterceptContext) -> InterceptResult;
}

/// `*` matches any; `prefix*`/`*suffix` match prefix/suffix; anything else
/// is an exact match (spec.md §4.6 step 3 "Matching is simple glob").
/// Deliberately hand-rolled rather than pulling in a glob crate — the rule
/// set is four cases, not a general pattern language.
pub fn glob_match(pattern: &str, target: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return target.starts_with(prefix);
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return target.ends_with(suffix);
    }
    pattern == target
}

/// Evaluates a plugin's allow/deny lists against `target` (spec.md §4.6
/// step 3): a non-empty allow list requires a match; a deny list forbids
/// one.
pub fn access_allowed(whitelist: &[String], blacklist: &[String], target: &str) -> bool {
    if !whitelist.is_empty() && !whitelist.iter().any(|p| glob_match(p, target)) {
        return false;
    }
    if blacklist.iter().any(|p| glob_match(p, target)) {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_cases() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("/api/*", "/api/users"));
        assert!(!glob_match("/api/*", "/other"));
        assert!(glob_match("*.json", "config.json"));
        assert!(!glob_match("*.json", "config.yaml"));
        assert!(glob_match("/exact", "/exact"));
        assert!(!glob_match("/exact", "/exact/"));
    }

    #[test]
    fn access_control_combines_allow_and_deny() {
        assert!(access_allowed(&[], &[], "/anything"));
        assert!(access_allowed(&["/api/*".to_string()], &[], "/api/x"));
        assert!(!access_allowed(&["/api/*".to_string()], &[], "/other"));
        assert!(!access_allowed(&[], &["/blocked".to_string()], "/blocked"));
    }
}
