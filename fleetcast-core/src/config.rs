use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "FLEETCAST_CONFIG_PATH";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub discovery: DiscoveryConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Where module instances come from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// Watch Pods through the Kubernetes API.
    #[default]
    Kubernetes,
    /// Send every call to one fixed endpoint.
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub mode: DiscoveryMode,
    /// Namespace to watch; unset watches all namespaces.
    pub namespace: Option<String>,
    /// Kubernetes label selector applied to the Pod watch.
    pub pod_selector: String,
    pub static_host: String,
    pub static_port: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mode: DiscoveryMode::Kubernetes,
            namespace: None,
            pod_selector: String::new(),
            static_host: "127.0.0.1".to_string(),
            static_port: 50051,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Labels an instance must carry to receive broadcasts.
    pub selector: HashMap<String, String>,
    /// Label holding the replica hash appended to instance names.
    pub template_hash_label: String,
    pub per_instance_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Capacity of the merged-stream queue.
    pub stream_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            selector: HashMap::from([("core.hyperion.io/master".to_string(), "true".to_string())]),
            template_hash_label: "pod-template-hash".to_string(),
            per_instance_timeout_ms: 5000,
            connect_timeout_ms: 2000,
            stream_buffer: 8,
        }
    }
}

impl GatewayConfig {
    #[must_use]
    pub const fn per_instance_timeout(&self) -> Duration {
        Duration::from_millis(self.per_instance_timeout_ms)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Config {
    /// Load configuration from an optional file, then `FLEETCAST_*` environment variables.
    ///
    /// Nested keys are separated by a double underscore
    /// (`FLEETCAST_SERVER__HTTP_PORT=9000`).
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("FLEETCAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Check the configuration, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.host.is_empty() {
            errors.push("server.host must not be empty".to_string());
        }
        if self.server.http_port == 0 {
            errors.push("server.http_port must not be 0".to_string());
        }
        if !matches!(
            self.logging.level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "warning" | "error"
        ) {
            errors.push(format!("logging.level is not a valid level: {:?}", self.logging.level));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {:?}",
                self.logging.format
            ));
        }

        if self.discovery.mode == DiscoveryMode::Static {
            if self.discovery.static_host.is_empty() {
                errors.push("discovery.static_host is required in static mode".to_string());
            }
            if self.discovery.static_port == 0 {
                errors.push("discovery.static_port must not be 0".to_string());
            }
        }

        if self.gateway.selector.is_empty() {
            errors.push("gateway.selector must contain at least one label".to_string());
        }
        if self.gateway.per_instance_timeout_ms == 0 {
            errors.push("gateway.per_instance_timeout_ms must be positive".to_string());
        }
        if self.gateway.connect_timeout_ms == 0 {
            errors.push("gateway.connect_timeout_ms must be positive".to_string());
        }
        if self.gateway.stream_buffer == 0 {
            errors.push("gateway.stream_buffer must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Load and validate configuration.
///
/// Config file search order:
/// 1. `explicit` (the `--config` flag or `FLEETCAST_CONFIG_PATH`)
/// 2. ./config.yaml (current working directory)
/// 3. /config/config.yaml (Kubernetes mount path)
/// 4. Environment variables only
///
/// Runs before logging is installed, so it does not log; callers report the
/// outcome once their subscriber is up (see [`config_file_path`]).
pub fn load_config(explicit: Option<&str>) -> anyhow::Result<Config> {
    let config_path = config_file_path(explicit);

    let config = match &config_path {
        Some(path) => Config::from_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load config file {path}: {e}"))?,
        None => Config::from_env().map_err(|e| anyhow::anyhow!("Failed to load config: {e}"))?,
    };

    if let Err(errors) = config.validate() {
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}

/// The config file [`load_config`] reads, if any.
#[must_use]
pub fn config_file_path(explicit: Option<&str>) -> Option<String> {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok())
        .filter(|p| Path::new(p).exists())
        .or_else(|| {
            ["config.yaml", "/config/config.yaml"]
                .into_iter()
                .find(|p| Path::new(p).exists())
                .map(str::to_string)
        })
}
