//! napgrid.toml configuration parser.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NapConfig {
    /// Namespace the fronted functions live in.
    pub namespace: String,
    pub proxy: ProxyConfig,
    pub dispatcher: DispatcherConfig,
    pub autoscale: AutoscaleConfig,
    pub cluster: ClusterConfig,
    pub store: StoreConfig,
    /// Static function catalogue served by the built-in orchestrator.
    pub functions: Vec<FunctionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Backend URL template; `{function_name}` and `{namespace}` are substituted.
    pub base_function_url: String,
    #[serde(with = "humantime_serde")]
    pub cold_start_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub cold_start_poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub activity_touch_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub max_async_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    #[serde(with = "humantime_serde")]
    pub tick: Duration,
    pub retry_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub retry_base_delay: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutoscaleConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    #[serde(with = "humantime_serde")]
    pub lease: Duration,
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub topology_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub activity_sync_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// redb file path. In-memory when absent.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionConfig {
    pub name: String,
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub replicas_min: u32,
    #[serde(default = "default_replicas_at_start")]
    pub replicas_at_start: u32,
    #[serde(default = "default_parallel_requests")]
    pub number_parallel_request: u32,
    #[serde(default = "default_idle_timeout")]
    pub timeout_seconds_before_scale_to_min: u64,
    #[serde(default)]
    pub start_with_any_function: bool,
}

fn default_replicas_at_start() -> u32 {
    1
}

fn default_parallel_requests() -> u32 {
    10
}

fn default_idle_timeout() -> u64 {
    300
}

impl Default for NapConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            proxy: ProxyConfig::default(),
            dispatcher: DispatcherConfig::default(),
            autoscale: AutoscaleConfig::default(),
            cluster: ClusterConfig::default(),
            store: StoreConfig::default(),
            functions: Vec::new(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            base_function_url: "http://{function_name}.{namespace}:8080".to_string(),
            cold_start_timeout: Duration::from_secs(10),
            cold_start_poll_interval: Duration::from_millis(50),
            activity_touch_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(300),
            max_async_body_bytes: 32 * 1024 * 1024,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(10),
            retry_attempts: 3,
            retry_base_delay: Duration::from_secs(2),
        }
    }
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(5),
            check_interval: Duration::from_secs(1),
            topology_interval: Duration::from_secs(2),
            activity_sync_interval: Duration::from_secs(1),
        }
    }
}

impl NapConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> ConfigResult<Self> {
        match path {
            Some(p) if p.exists() => Self::from_file(p),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let config: NapConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::Invalid("namespace must not be empty".into()));
        }
        let zero_intervals = [
            ("proxy.cold_start_poll_interval", self.proxy.cold_start_poll_interval),
            ("proxy.activity_touch_interval", self.proxy.activity_touch_interval),
            ("dispatcher.tick", self.dispatcher.tick),
            ("autoscale.interval", self.autoscale.interval),
            ("cluster.check_interval", self.cluster.check_interval),
            ("cluster.topology_interval", self.cluster.topology_interval),
            ("cluster.activity_sync_interval", self.cluster.activity_sync_interval),
        ];
        if let Some((name, _)) = zero_intervals.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }

        let mut seen = HashSet::new();
        for function in &self.functions {
            if function.name.trim().is_empty() {
                return Err(ConfigError::Invalid("function name must not be empty".into()));
            }
            if !seen.insert(function.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate function name: {}",
                    function.name
                )));
            }
        }
        Ok(())
    }
}
