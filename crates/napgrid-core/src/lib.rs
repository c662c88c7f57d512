pub mod config;

pub use config::{
    AutoscaleConfig, ClusterConfig, ConfigError, ConfigResult, DispatcherConfig, FunctionConfig,
    NapConfig, ProxyConfig, StoreConfig,
};
