//! Configuration file model
//!
//! Mirrors the on-disk layout:
//!
//! ```yaml
//! version: 1
//! settings:
//!   maxDelayMs: 10000
//! defaults:
//!   context: dev-ctx
//! environments:
//!   dev:
//!     namespaces:
//!       ns1:
//!         forwards:
//!           - kind: service
//!             name: api
//!             ports:
//!               - localPort: 8080
//!                 remotePort: 80
//!   staging:
//!     extends: dev
//!     context: staging-ctx
//! ```
//!
//! Values are kept as declared (kinds as strings, ports as signed integers)
//! so that validation happens in one place, the resolver. Unknown keys are
//! rejected at parse time.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::forwarding::RetryConfig;

/// Current configuration format version
pub const CONFIG_VERSION: u32 = 1;

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigFile {
    /// Format version
    #[serde(default = "default_version")]
    pub version: u32,
    /// Engine tuning
    #[serde(default)]
    pub settings: EngineSettings,
    /// Fallbacks for every environment
    #[serde(default)]
    pub defaults: TargetDefaults,
    /// Environments keyed by name
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            settings: EngineSettings::default(),
            defaults: TargetDefaults::default(),
            environments: BTreeMap::new(),
        }
    }
}

/// Where an environment's forwards connect and bind
///
/// Every field is optional; the effective value comes from the environment,
/// then its `extends` ancestors, then the top-level `defaults`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TargetDefaults {
    /// Kubeconfig file to load instead of the default one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
    /// Kubeconfig context to connect through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Local address for every forward
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<Ipv4Addr>,
}

impl TargetDefaults {
    /// `self` with every field that `over` sets replaced
    pub fn merged(&self, over: &TargetDefaults) -> TargetDefaults {
        TargetDefaults {
            kubeconfig: over.kubeconfig.clone().or_else(|| self.kubeconfig.clone()),
            context: over.context.clone().or_else(|| self.context.clone()),
            bind_address: over.bind_address.or(self.bind_address),
        }
    }
}

/// One named environment (a cluster context plus what to forward from it)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EnvironmentConfig {
    /// Environment to inherit targets and forwards from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
    /// Kubeconfig context to connect through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Local address for every forward in this environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<Ipv4Addr>,
    /// Namespaces keyed by name; inherited from the parent when empty
    #[serde(default)]
    pub namespaces: BTreeMap<String, NamespaceConfig>,
}

impl EnvironmentConfig {
    /// The target fields this environment sets itself
    pub fn target(&self) -> TargetDefaults {
        TargetDefaults {
            kubeconfig: self.kubeconfig.clone(),
            context: self.context.clone(),
            bind_address: self.bind_address,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NamespaceConfig {
    #[serde(default)]
    pub forwards: Vec<ForwardConfig>,
}

/// A forward declaration: one resource, one or more port pairs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ForwardConfig {
    /// Resource kind (pod, service, deployment, statefulset)
    pub kind: String,
    /// Resource name
    pub name: String,
    /// Container whose ports named service ports resolve against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default)]
    pub ports: Vec<PortConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PortConfig {
    pub local_port: i64,
    pub remote_port: i64,
    /// Overrides the environment bind address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<Ipv4Addr>,
}

/// Engine tuning shared by every environment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct EngineSettings {
    /// Backoff base before the first reconnect attempt (ms)
    pub initial_delay_ms: u64,
    /// Backoff cap (ms)
    pub max_delay_ms: u64,
    /// Consecutive failed attempts before a forward gives up, unlimited if unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// How long shutdown waits for forwards to close (ms)
    pub shutdown_grace_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000, // 1 second
            max_delay_ms: 30000,    // 30 seconds
            max_retries: None,
            shutdown_grace_ms: 5000,
        }
    }
}

impl EngineSettings {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_retries: self.max_retries,
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
