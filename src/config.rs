//! Proxy configuration (spec.md §6 "Config options recognized").
//!
//! `Config` is the external value object the core depends on but does not
//! own the on-disk format of (spec.md §1): the UI/CLI layers may serialize
//! it however they like, as long as they hand the core a `Config`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_threads() -> usize {
    4
}

fn default_buffer_size() -> usize {
    8192
}

fn default_read_timeout_ms() -> u64 {
    30_000
}

fn default_write_timeout_ms() -> u64 {
    30_000
}

fn default_watch_interval_ms() -> u64 {
    5_000
}

/// All options recognized by the proxy core, per spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener bind address.
    #[serde(default = "default_address")]
    pub address: String,
    /// Listener port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Accept-worker count.
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Per-read buffer size for the generic TCP processor.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Per-connection read deadline, in milliseconds.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Per-connection write deadline, in milliseconds.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Gate for info/debug log lines.
    #[serde(default)]
    pub logging_enabled: bool,
    /// Directory scanned for shared-object plugins. `None` disables
    /// dynamic-loading discovery; factory plugins still load.
    #[serde(default)]
    pub plugins_dir: Option<PathBuf>,
    /// Directory holding per-plugin JSON config.
    #[serde(default)]
    pub config_dir: Option<PathBuf>,
    /// Load plugins on start.
    #[serde(default)]
    pub auto_load: bool,
    /// Reserved; no-op when false (spec.md §6).
    #[serde(default)]
    pub enable_hot_reload: bool,
    /// Poll interval for hot reload, in milliseconds. Ignored unless
    /// `enable_hot_reload` is set.
    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,
    /// CA store directory. Empty resolves to `$HOME/.sniffy/` (spec.md §6).
    #[serde(default)]
    pub ca_store_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            threads: default_threads(),
            buffer_size: default_buffer_size(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            logging_enabled: false,
            plugins_dir: None,
            config_dir: None,
            auto_load: false,
            enable_hot_reload: false,
            watch_interval_ms: default_watch_interval_ms(),
            ca_store_dir: String::new(),
        }
    }
}

impl Config {
    /// Loads a JSON config from `path` if it exists, else returns the
    /// default — mirroring the teacher's "load config if present, else
    /// default to monitor mode" pattern.
    pub fn load_or_default(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    pub fn read_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.write_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_monitor_style_defaults() {
        let config = Config::default();
        assert_eq!(config.address, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert!(!config.auto_load);
        assert!(!config.enable_hot_reload);
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        let config = Config::load_or_default(std::path::Path::new("/nonexistent/sniffy.json"))
            .expect("default load never fails");
        assert_eq!(config.port, 8080);
    }
}
