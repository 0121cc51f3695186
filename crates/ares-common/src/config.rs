//! Configuration for Ares processes.
//!
//! A single [`AresConfig`] carries the registry, client and server sections.
//! Values come from defaults, then an optional TOML file, then `ARES_*`
//! environment variables.
//!
//! ```toml
//! [registry]
//! address = "127.0.0.1:2181"
//!
//! [client]
//! app_key = "ares"
//! cluster_strategy = "Polling"
//!
//! [server]
//! bind = "0.0.0.0:8081"
//! max_concurrency = 32
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::protocol::descriptors::{DEFAULT_GROUP, DEFAULT_TIMEOUT_MS};
use crate::protocol::error::{Result, RpcError};

pub const DEFAULT_ROOT_PATH: &str = "/config_register";
pub const DEFAULT_BIND: &str = "0.0.0.0:8081";

/// Names accepted for `client.cluster_strategy`.
pub const CLUSTER_STRATEGIES: [&str; 5] = ["Random", "WeightRandom", "Polling", "WeightPolling", "Hash"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AresConfig {
    pub registry: RegistrySection,
    pub client: ClientSection,
    pub server: ServerSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    /// `host:port` of the coordination server
    pub address: String,
    pub root_path: String,
    /// Silence after which the coordination server ends a session
    pub session_timeout_ms: u64,
    /// Budget for connecting and opening a session
    pub connection_timeout_ms: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:2181".to_string(),
            root_path: DEFAULT_ROOT_PATH.to_string(),
            session_timeout_ms: 10_000,
            connection_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub app_key: String,
    pub group: String,
    pub timeout_ms: u64,
    /// Size of the bounded worker pool used by cluster proxies
    pub worker_threads: usize,
    pub cluster_strategy: String,
    pub channels_per_address: usize,
    pub connect_timeout_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            app_key: "ares".to_string(),
            group: DEFAULT_GROUP.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            worker_threads: 16,
            cluster_strategy: "WeightRandom".to_string(),
            channels_per_address: 10,
            connect_timeout_ms: 3_000,
            sweep_interval_ms: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub app_key: String,
    pub group: String,
    pub weight: u32,
    pub max_concurrency: u32,
    pub timeout_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            app_key: "ares".to_string(),
            group: DEFAULT_GROUP.to_string(),
            weight: 1,
            max_concurrency: 10,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl AresConfig {
    /// Load configuration from a TOML file. Missing keys keep their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RpcError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `ARES_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply `ARES_*` overrides using `lookup` as the variable source.
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ARES_REGISTRY_ADDRESS") {
            self.registry.address = v;
        }
        if let Some(v) = lookup("ARES_REGISTRY_ROOT_PATH") {
            self.registry.root_path = v;
        }
        if let Some(v) = lookup("ARES_REGISTRY_SESSION_TIMEOUT_MS") {
            self.registry.session_timeout_ms = parse_env("ARES_REGISTRY_SESSION_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("ARES_REGISTRY_CONNECTION_TIMEOUT_MS") {
            self.registry.connection_timeout_ms = parse_env("ARES_REGISTRY_CONNECTION_TIMEOUT_MS", &v)?;
        }

        if let Some(v) = lookup("ARES_CLIENT_APP_KEY") {
            self.client.app_key = v;
        }
        if let Some(v) = lookup("ARES_CLIENT_GROUP") {
            self.client.group = v;
        }
        if let Some(v) = lookup("ARES_CLIENT_TIMEOUT_MS") {
            self.client.timeout_ms = parse_env("ARES_CLIENT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("ARES_CLIENT_WORKER_THREADS") {
            self.client.worker_threads = parse_env("ARES_CLIENT_WORKER_THREADS", &v)?;
        }
        if let Some(v) = lookup("ARES_CLIENT_CLUSTER_STRATEGY") {
            self.client.cluster_strategy = v;
        }
        if let Some(v) = lookup("ARES_CLIENT_CHANNELS_PER_ADDRESS") {
            self.client.channels_per_address = parse_env("ARES_CLIENT_CHANNELS_PER_ADDRESS", &v)?;
        }

        if let Some(v) = lookup("ARES_SERVER_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = lookup("ARES_SERVER_APP_KEY") {
            self.server.app_key = v;
        }
        if let Some(v) = lookup("ARES_SERVER_GROUP") {
            self.server.group = v;
        }
        if let Some(v) = lookup("ARES_SERVER_WEIGHT") {
            self.server.weight = parse_env("ARES_SERVER_WEIGHT", &v)?;
        }
        if let Some(v) = lookup("ARES_SERVER_MAX_CONCURRENCY") {
            self.server.max_concurrency = parse_env("ARES_SERVER_MAX_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("ARES_SERVER_TIMEOUT_MS") {
            self.server.timeout_ms = parse_env("ARES_SERVER_TIMEOUT_MS", &v)?;
        }

        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.registry.root_path.starts_with('/') {
            return Err(RpcError::Config(format!(
                "registry.root_path must start with '/', got '{}'",
                self.registry.root_path
            )));
        }
        if self.registry.address.is_empty() {
            return Err(RpcError::Config("registry.address must not be empty".to_string()));
        }
        if self.registry.session_timeout_ms == 0 || self.registry.connection_timeout_ms == 0 {
            return Err(RpcError::Config(
                "registry session and connection timeouts must be greater than 0".to_string(),
            ));
        }
        if self.client.app_key.is_empty() || self.server.app_key.is_empty() {
            return Err(RpcError::Config("app_key must not be empty".to_string()));
        }
        if self.client.timeout_ms == 0 || self.server.timeout_ms == 0 {
            return Err(RpcError::Config("timeout_ms must be greater than 0".to_string()));
        }
        if self.client.worker_threads == 0 {
            return Err(RpcError::Config("client.worker_threads must be greater than 0".to_string()));
        }
        if self.client.channels_per_address == 0 {
            return Err(RpcError::Config(
                "client.channels_per_address must be greater than 0".to_string(),
            ));
        }
        if self.client.sweep_interval_ms == 0 {
            return Err(RpcError::Config("client.sweep_interval_ms must be greater than 0".to_string()));
        }
        if !CLUSTER_STRATEGIES.contains(&self.client.cluster_strategy.as_str()) {
            return Err(RpcError::Config(format!(
                "unknown cluster strategy '{}'",
                self.client.cluster_strategy
            )));
        }
        if self.server.weight == 0 {
            return Err(RpcError::Config("server.weight must be greater than 0".to_string()));
        }
        if self.server.max_concurrency == 0 {
            return Err(RpcError::Config("server.max_concurrency must be greater than 0".to_string()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RpcError::Config(format!("invalid value for {}: '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AresConfig::default();
        assert_eq!(config.registry.root_path, "/config_register");
        assert_eq!(config.client.group, "default");
        assert_eq!(config.client.timeout_ms, 3000);
        assert_eq!(config.client.cluster_strategy, "WeightRandom");
        assert_eq!(config.client.sweep_interval_ms, 10);
        assert_eq!(config.server.bind, "0.0.0.0:8081");
        assert_eq!(config.server.max_concurrency, 10);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[client]
app_key = "shop"
cluster_strategy = "Polling"

[server]
max_concurrency = 1
"#
        )
        .unwrap();

        let config = AresConfig::load(file.path()).unwrap();
        assert_eq!(config.client.app_key, "shop");
        assert_eq!(config.client.cluster_strategy, "Polling");
        assert_eq!(config.client.worker_threads, 16);
        assert_eq!(config.server.max_concurrency, 1);
        assert_eq!(config.registry, RegistrySection::default());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = AresConfig::load(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(RpcError::Config(_))));
    }

    #[test]
    fn test_malformed_toml() {
        let result = AresConfig::from_toml("[client\napp_key = 1");
        assert!(matches!(result, Err(RpcError::Config(_))));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("ARES_CLIENT_APP_KEY", "billing"),
            ("ARES_CLIENT_WORKER_THREADS", "4"),
            ("ARES_SERVER_BIND", "127.0.0.1:9000"),
        ]
        .into_iter()
        .collect();

        let config = AresConfig::default()
            .apply_env_from(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.client.app_key, "billing");
        assert_eq!(config.client.worker_threads, 4);
        assert_eq!(config.server.bind, "127.0.0.1:9000");
        assert_eq!(config.server.app_key, "ares");
    }

    #[test]
    fn test_env_invalid_number() {
        let result = AresConfig::default().apply_env_from(|k| {
            (k == "ARES_SERVER_WEIGHT").then(|| "heavy".to_string())
        });
        assert!(matches!(result, Err(RpcError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AresConfig::default();
        config.client.cluster_strategy = "LeastLoaded".to_string();
        assert!(config.validate().is_err());

        let mut config = AresConfig::default();
        config.server.weight = 0;
        assert!(config.validate().is_err());

        let mut config = AresConfig::default();
        config.registry.root_path = "config_register".to_string();
        assert!(config.validate().is_err());

        let mut config = AresConfig::default();
        config.registry.session_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides_registry_section() {
        let vars: HashMap<&str, &str> = [
            ("ARES_REGISTRY_ADDRESS", "10.0.0.5:2181"),
            ("ARES_REGISTRY_SESSION_TIMEOUT_MS", "4000"),
            ("ARES_REGISTRY_CONNECTION_TIMEOUT_MS", "250"),
        ]
        .into_iter()
        .collect();

        let config = AresConfig::default()
            .apply_env_from(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.registry.address, "10.0.0.5:2181");
        assert_eq!(config.registry.session_timeout_ms, 4000);
        assert_eq!(config.registry.connection_timeout_ms, 250);
    }
}
