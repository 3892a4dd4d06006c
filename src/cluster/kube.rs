//! Kubernetes cluster sessions
//!
//! Opens port-forward streams through the Kubernetes API. Services,
//! deployments and statefulsets are resolved to one running, ready pod
//! behind them on every channel request, so a reconnect follows pods that
//! were rescheduled.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, ResourceExt};
use tracing::{debug, trace};

use super::{BoxedChannel, ChannelTarget, ClusterSession, ClusterSessionFactory};
use crate::forwarding::{ForwardError, ResourceKind};

/// Builds one API client per kubeconfig context
#[derive(Debug, Clone, Default)]
pub struct KubeSessionFactory {
    kubeconfig: Option<PathBuf>,
}

impl KubeSessionFactory {
    /// Use the default kubeconfig (`KUBECONFIG` or `~/.kube/config`)
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit kubeconfig file
    pub fn with_kubeconfig(path: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: Some(path.into()),
        }
    }

    async fn config(&self, context: &str) -> Result<Config, ForwardError> {
        let options = KubeConfigOptions {
            context: Some(context.to_string()),
            ..Default::default()
        };
        let config = match &self.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    ForwardError::ConnectFailed(format!(
                        "failed to read kubeconfig {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &options).await
            }
            None => Config::from_kubeconfig(&options).await,
        };
        config.map_err(|e| {
            ForwardError::ConnectFailed(format!("kubeconfig context {}: {}", context, e))
        })
    }
}

#[async_trait]
impl ClusterSessionFactory for KubeSessionFactory {
    async fn session(&self, context: &str) -> Result<Arc<dyn ClusterSession>, ForwardError> {
        let config = self.config(context).await?;
        debug!("Connecting to {} for context {}", config.cluster_url, context);
        let client = Client::try_from(config).map_err(|e| {
            ForwardError::ConnectFailed(format!("client for context {}: {}", context, e))
        })?;
        Ok(Arc::new(KubeClusterSession::new(context, client)))
    }
}

/// Port-forward streams for one context, sharing its API client
#[derive(Clone)]
pub struct KubeClusterSession {
    context: String,
    client: Client,
}

impl KubeClusterSession {
    pub fn new(context: impl Into<String>, client: Client) -> Self {
        Self {
            context: context.into(),
            client,
        }
    }

    /// Pod name and container port a channel to `target` should use
    async fn resolve(&self, target: &ChannelTarget) -> Result<(String, u16), ForwardError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let fail = |e: kube::Error| connect_failed(target, e);
        let container = target.container.as_deref();

        let (pod, port) = match target.kind {
            ResourceKind::Pod => {
                let pod = pods.get(&target.name).await.map_err(fail)?;
                (pod, target.remote_port)
            }
            ResourceKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &target.namespace);
                let deployment = api.get(&target.name).await.map_err(fail)?;
                let labels = deployment
                    .spec
                    .and_then(|s| s.selector.match_labels)
                    .unwrap_or_default();
                (self.ready_pod(&pods, target, &labels).await?, target.remote_port)
            }
            ResourceKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &target.namespace);
                let set = api.get(&target.name).await.map_err(fail)?;
                let labels = set
                    .spec
                    .and_then(|s| s.selector.match_labels)
                    .unwrap_or_default();
                (self.ready_pod(&pods, target, &labels).await?, target.remote_port)
            }
            ResourceKind::Service => {
                let api: Api<Service> = Api::namespaced(self.client.clone(), &target.namespace);
                let service = api.get(&target.name).await.map_err(fail)?;
                let labels = service
                    .spec
                    .as_ref()
                    .and_then(|s| s.selector.clone())
                    .unwrap_or_default();
                let pod = self.ready_pod(&pods, target, &labels).await?;
                let port = service_target_port(&service, &pod, target.remote_port, container)
                    .map_err(|reason| ForwardError::ConnectFailed(format!("{}: {}", target, reason)))?;
                (pod, port)
            }
        };

        if let Some(container) = container {
            if !has_container(&pod, container) {
                return Err(ForwardError::ConnectFailed(format!(
                    "{}: pod {} has no container {}",
                    target,
                    pod.name_any(),
                    container
                )));
            }
        }
        Ok((pod.name_any(), port))
    }

    async fn ready_pod(
        &self,
        pods: &Api<Pod>,
        target: &ChannelTarget,
        labels: &BTreeMap<String, String>,
    ) -> Result<Pod, ForwardError> {
        let selector = label_selector(labels).ok_or_else(|| {
            ForwardError::ConnectFailed(format!("{} has no pod selector", target))
        })?;
        let params = ListParams::default()
            .labels(&selector)
            .fields("status.phase=Running");
        let list = pods
            .list(&params)
            .await
            .map_err(|e| connect_failed(target, e))?;
        pick_ready(list.items).ok_or_else(|| {
            ForwardError::ConnectFailed(format!("{}: no ready pod matches {}", target, selector))
        })
    }
}

#[async_trait]
impl ClusterSession for KubeClusterSession {
    async fn open_channel(&self, target: &ChannelTarget) -> Result<BoxedChannel, ForwardError> {
        let (pod_name, port) = self.resolve(target).await?;
        trace!(context = %self.context, pod_name, port, "Opening port-forward");

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let mut forwarder = pods
            .portforward(&pod_name, &[port])
            .await
            .map_err(|e| connect_failed(target, e))?;
        let stream = forwarder.take_stream(port).ok_or_else(|| {
            ForwardError::ConnectFailed(format!("{}: port {} not found in forwarder", target, port))
        })?;

        let label = target.to_string();
        tokio::spawn(async move {
            if let Err(e) = forwarder.join().await {
                debug!("Port-forward for {} ended: {}", label, e);
            }
        });

        Ok(Box::new(stream))
    }
}

impl std::fmt::Debug for KubeClusterSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterSession")
            .field("context", &self.context)
            .finish()
    }
}

fn connect_failed(target: &ChannelTarget, e: kube::Error) -> ForwardError {
    ForwardError::ConnectFailed(format!("{}: {}", target, e))
}

/// `k1=v1,k2=v2`, or `None` for an empty selector
fn label_selector(labels: &BTreeMap<String, String>) -> Option<String> {
    if labels.is_empty() {
        return None;
    }
    let parts: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    Some(parts.join(","))
}

fn is_ready(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

fn pick_ready(pods: Vec<Pod>) -> Option<Pod> {
    pods.into_iter().find(is_ready)
}

/// Map a service port to the port of the pod behind it
///
/// Named target ports are looked up in `container` when given, otherwise
/// in every container of the pod.
fn service_target_port(
    service: &Service,
    pod: &Pod,
    service_port: u16,
    container: Option<&str>,
) -> Result<u16, String> {
    let ports = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .ok_or_else(|| "service has no ports".to_string())?;
    let port = ports
        .iter()
        .find(|p| p.port == i32::from(service_port))
        .ok_or_else(|| format!("service has no port {}", service_port))?;

    let number = match &port.target_port {
        None => port.port,
        Some(IntOrString::Int(n)) => *n,
        Some(IntOrString::String(name)) => named_container_port(pod, name, container)
            .ok_or_else(|| format!("pod {} has no port named {}", pod.name_any(), name))?,
    };
    u16::try_from(number).map_err(|_| format!("invalid target port {}", number))
}

fn named_container_port(pod: &Pod, name: &str, container: Option<&str>) -> Option<i32> {
    let spec = pod.spec.as_ref()?;
    spec.containers
        .iter()
        .filter(|c| container.map_or(true, |wanted| c.name == wanted))
        .filter_map(|c| c.ports.as_ref())
        .flatten()
        .find(|p| p.name.as_deref() == Some(name))
        .map(|p| p.container_port)
}

fn has_container(pod: &Pod, container: &str) -> bool {
    pod.spec
        .as_ref()
        .map(|spec| spec.containers.iter().any(|c| c.name == container))
        .unwrap_or(false)
}
