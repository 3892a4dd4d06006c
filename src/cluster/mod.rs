//! Cluster Sessions
//!
//! The engine never talks to the Kubernetes API itself. It asks a
//! [`ClusterSession`] for byte-stream channels to a resource port, and a
//! [`ClusterSessionFactory`] for one session per kubeconfig context.
//!
//! # Sharing
//!
//! Forwards that use the same context share one [`ContextSession`], which
//! creates the underlying session lazily (a failed creation is retried on
//! the next channel request) and serialises channel handshakes when the
//! session asks for it. Channels themselves are owned by whoever opened
//! them; nothing on the data path is shared.

#[cfg(feature = "kube-client")]
pub mod kube;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use crate::forwarding::{ForwardError, ForwardSpec, ResourceKind};

/// A bidirectional byte stream to a remote resource port
pub trait ChannelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ChannelStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedChannel = Box<dyn ChannelStream>;

/// What a channel should connect to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelTarget {
    pub context: String,
    pub namespace: String,
    pub kind: ResourceKind,
    pub name: String,
    pub remote_port: u16,
    pub container: Option<String>,
}

impl From<&ForwardSpec> for ChannelTarget {
    fn from(spec: &ForwardSpec) -> Self {
        Self {
            context: spec.context.clone(),
            namespace: spec.namespace.clone(),
            kind: spec.kind,
            name: spec.name.clone(),
            remote_port: spec.remote_port,
            container: spec.container.clone(),
        }
    }
}

impl std::fmt::Display for ChannelTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}:{}",
            self.context, self.namespace, self.kind, self.name, self.remote_port
        )
    }
}

/// Stream establishment for one cluster context
#[async_trait]
pub trait ClusterSession: Send + Sync {
    /// Open a channel to `target`, failing with [`ForwardError::ConnectFailed`]
    async fn open_channel(&self, target: &ChannelTarget) -> Result<BoxedChannel, ForwardError>;

    /// Whether concurrent channel handshakes must be serialised
    fn serializes_handshake(&self) -> bool {
        false
    }
}

/// Creates cluster sessions per context
#[async_trait]
pub trait ClusterSessionFactory: Send + Sync {
    async fn session(&self, context: &str) -> Result<Arc<dyn ClusterSession>, ForwardError>;

    /// Whether forwards of the same context may share one session
    fn shares_sessions(&self) -> bool {
        true
    }
}

/// Lazily-created session for one context, shareable between forwards
pub struct ContextSession {
    context: String,
    factory: Arc<dyn ClusterSessionFactory>,
    session: OnceCell<Arc<dyn ClusterSession>>,
    handshake: Mutex<()>,
}

impl ContextSession {
    pub fn new(context: impl Into<String>, factory: Arc<dyn ClusterSessionFactory>) -> Self {
        Self {
            context: context.into(),
            factory,
            session: OnceCell::new(),
            handshake: Mutex::new(()),
        }
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    async fn inner(&self) -> Result<&Arc<dyn ClusterSession>, ForwardError> {
        self.session
            .get_or_try_init(|| async {
                debug!("Creating cluster session for context {}", self.context);
                self.factory.session(&self.context).await
            })
            .await
    }
}

#[async_trait]
impl ClusterSession for ContextSession {
    async fn open_channel(&self, target: &ChannelTarget) -> Result<BoxedChannel, ForwardError> {
        let session = self.inner().await?;
        if session.serializes_handshake() {
            let _guard = self.handshake.lock().await;
            session.open_channel(target).await
        } else {
            session.open_channel(target).await
        }
    }

    fn serializes_handshake(&self) -> bool {
        // Handled here, callers never need to serialise again
        false
    }
}

impl std::fmt::Debug for ContextSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextSession")
            .field("context", &self.context)
            .field("initialized", &self.session.initialized())
            .finish()
    }
}
