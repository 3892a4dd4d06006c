//! Forward Specs
//!
//! Flattens an environment declaration into concrete forward targets and
//! validates them before anything touches the network.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::environment::effective_environment;
use super::error::ForwardError;
use crate::config::ConfigFile;

/// Local address used when neither the environment nor the port entry sets one
pub const DEFAULT_BIND_ADDRESS: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Kubernetes resource kinds supported as forward targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Pod,
    Service,
    Deployment,
    StatefulSet,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Pod => "pod",
            ResourceKind::Service => "service",
            ResourceKind::Deployment => "deployment",
            ResourceKind::StatefulSet => "statefulset",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    /// Accepts the kubectl spellings: singular, plural and short names
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pod" | "pods" | "po" => Ok(ResourceKind::Pod),
            "service" | "services" | "svc" => Ok(ResourceKind::Service),
            "deployment" | "deployments" | "deploy" => Ok(ResourceKind::Deployment),
            "statefulset" | "statefulsets" | "sts" => Ok(ResourceKind::StatefulSet),
            _ => Err(s.to_string()),
        }
    }
}

/// Stable, printable identity of a forward
///
/// Built from the spec's identity tuple, so two specs with the same target
/// and ports always share an id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ForwardId(String);

impl ForwardId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ForwardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One concrete forward: a local port bound to one remote resource port
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardSpec {
    pub context: String,
    pub namespace: String,
    pub kind: ResourceKind,
    pub name: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub bind_address: IpAddr,
    /// Container named service ports are looked up in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

impl ForwardSpec {
    pub fn new(
        context: impl Into<String>,
        namespace: impl Into<String>,
        kind: ResourceKind,
        name: impl Into<String>,
        local_port: u16,
        remote_port: u16,
    ) -> Self {
        Self {
            context: context.into(),
            namespace: namespace.into(),
            kind,
            name: name.into(),
            local_port,
            remote_port,
            bind_address: IpAddr::V4(DEFAULT_BIND_ADDRESS),
            container: None,
        }
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Set the local bind address
    pub fn with_bind_address(mut self, addr: impl Into<IpAddr>) -> Self {
        self.bind_address = addr.into();
        self
    }

    pub fn id(&self) -> ForwardId {
        ForwardId(format!(
            "{}/{}/{}/{}:{}->{}",
            self.context, self.namespace, self.kind, self.name, self.local_port, self.remote_port
        ))
    }

    /// Address the local listener binds to
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.local_port)
    }
}

fn port_in_range(value: i64, context: &str) -> Result<u16, ForwardError> {
    match u16::try_from(value) {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ForwardError::InvalidPort {
            context: context.to_string(),
            port: value,
        }),
    }
}

/// Resolve one environment of `config` into concrete forwards.
///
/// Applies `defaults` and `extends` first, then produces one
/// [`ForwardSpec`] per declared port entry. Namespaces are visited in name
/// order, forwards and ports in declaration order, so the output is
/// deterministic for a given file. Fails on the first invalid declaration;
/// nothing is partially returned.
pub fn resolve(config: &ConfigFile, environment: &str) -> Result<Vec<ForwardSpec>, ForwardError> {
    let env = effective_environment(config, environment)?;

    let mut specs = Vec::new();
    let mut claims: BTreeMap<u16, Vec<String>> = BTreeMap::new();

    for (namespace, ns) in env.namespaces {
        for (index, forward) in ns.forwards.iter().enumerate() {
            let context = format!(
                "environments.{}.namespaces.{}.forwards[{}]",
                environment, namespace, index
            );
            let kind = ResourceKind::from_str(&forward.kind).map_err(|kind| {
                ForwardError::UnsupportedKind {
                    context: context.clone(),
                    kind,
                }
            })?;
            if forward.name.trim().is_empty() {
                return Err(ForwardError::InvalidDeclaration {
                    context: format!("{}.name", context),
                    reason: "resource name cannot be empty".to_string(),
                });
            }
            if forward.ports.is_empty() {
                return Err(ForwardError::InvalidDeclaration {
                    context: format!("{}.ports", context),
                    reason: "forward must declare at least one port".to_string(),
                });
            }
            let container = forward.container.as_deref().filter(|c| !c.is_empty());

            for (port_index, port) in forward.ports.iter().enumerate() {
                let port_context = format!("{}.ports[{}]", context, port_index);
                let local_port =
                    port_in_range(port.local_port, &format!("{}.localPort", port_context))?;
                let remote_port =
                    port_in_range(port.remote_port, &format!("{}.remotePort", port_context))?;

                let mut spec = ForwardSpec::new(
                    env.context.clone(),
                    namespace.clone(),
                    kind,
                    forward.name.clone(),
                    local_port,
                    remote_port,
                )
                .with_bind_address(port.bind_address.unwrap_or(env.bind_address));
                if let Some(container) = container {
                    spec = spec.with_container(container);
                }

                claims.entry(local_port).or_default().push(format!(
                    "{}/{}/{}/{}:{}->{}",
                    environment, namespace, kind, forward.name, local_port, remote_port
                ));
                specs.push(spec);
            }
        }
    }

    if specs.is_empty() {
        return Err(ForwardError::EmptyEnvironment(environment.to_string()));
    }

    if let Some((port, claimants)) = claims.into_iter().find(|(_, c)| c.len() > 1) {
        return Err(ForwardError::PortConflict { port, claimants });
    }

    Ok(specs)
}
