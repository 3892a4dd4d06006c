//! Configuration Management Module
//!
//! Loads the declarative forward configuration from disk. Validation and
//! flattening into concrete forwards is done by the resolver in
//! `forwarding::spec`.

pub mod storage;
pub mod types;

pub use storage::{config_dir, default_config_path, ConfigStorage, StorageError, DEFAULT_CONFIG_FILE};
pub use types::{
    ConfigFile, EngineSettings, EnvironmentConfig, ForwardConfig, NamespaceConfig, PortConfig,
    TargetDefaults, CONFIG_VERSION,
};
