//! Tunnel Sessions
//!
//! A tunnel session owns the local listener of one forward and keeps a
//! remote channel path to its resource alive:
//!
//! ```text
//! Idle -> Connecting -> Active <-> Degraded -> Connecting ...
//!                   \-> Degraded
//! any state -> Closed
//! ```
//!
//! The listener is bound once and stays open across reconnects. While the
//! session is `Connecting` or `Degraded` new clients queue in the accept
//! backlog and are served once the channel is back.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::RetryConfig;
use super::error::ForwardError;
use super::events::StatusReporter;
use super::relay::{PairExit, StreamPair};
use super::spec::{ForwardId, ForwardSpec};
use crate::cluster::{BoxedChannel, ChannelTarget, ClusterSession};

/// Pause after a failed accept before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Connection state of a tunnel session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Degraded,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Degraded => "degraded",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Statistics for a forward
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardStats {
    /// Total connections handled
    pub connection_count: u64,
    /// Active connections right now
    pub active_connections: u64,
    /// Total bytes sent (client -> cluster)
    pub bytes_sent: u64,
    /// Total bytes received (cluster -> client)
    pub bytes_received: u64,
}

enum ConnectStep {
    Ready(BoxedChannel),
    Failed(ForwardError),
    Cancelled,
}

enum ServeExit {
    ChannelLost(ForwardError),
    Cancelled,
}

/// One forward: a local listener plus its reconnecting remote path
pub struct TunnelSession {
    spec: ForwardSpec,
    id: ForwardId,
    target: ChannelTarget,
    cluster: Arc<dyn ClusterSession>,
    retry: RetryConfig,
    reporter: StatusReporter,
    stats: Arc<parking_lot::RwLock<ForwardStats>>,
}

impl TunnelSession {
    /// Create a session and register it with `reporter` as `Idle`
    pub fn new(
        spec: ForwardSpec,
        cluster: Arc<dyn ClusterSession>,
        retry: RetryConfig,
        reporter: StatusReporter,
    ) -> Self {
        let stats = Arc::new(parking_lot::RwLock::new(ForwardStats::default()));
        reporter.register(&spec, stats.clone());
        Self {
            id: spec.id(),
            target: ChannelTarget::from(&spec),
            spec,
            cluster,
            retry,
            reporter,
            stats,
        }
    }

    pub fn id(&self) -> &ForwardId {
        &self.id
    }

    pub fn spec(&self) -> &ForwardSpec {
        &self.spec
    }

    /// Spawn the session on the runtime
    pub fn start(self) -> SessionHandle {
        let cancel = CancellationToken::new();
        let id = self.id.clone();
        let stats = self.stats.clone();
        let task = tokio::spawn(self.run(cancel.clone()));
        SessionHandle {
            id,
            cancel,
            stats,
            task,
        }
    }

    /// Drive the session until `cancel` fires or it closes on its own
    ///
    /// Always finishes with a `Closed` report.
    pub async fn run(self, cancel: CancellationToken) {
        let addr = self.spec.local_addr();
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                let err = ForwardError::bind_failed(addr, &e);
                error!("Forward {}: {}", self.id, err);
                self.reporter.report(&self.id, SessionState::Closed, Some(&err));
                return;
            }
        };
        info!("Listening on {} for {}", addr, self.target);

        let outcome = self.reconnect_loop(&listener, &cancel).await;

        drop(listener);
        match outcome {
            Ok(()) => {
                info!("Forward {} stopped", self.id);
                self.reporter.report(&self.id, SessionState::Closed, None);
            }
            Err(err) => {
                warn!("Forward {} gave up: {}", self.id, err);
                self.reporter.report(&self.id, SessionState::Closed, Some(&err));
            }
        }
    }

    /// Connect, serve, and reconnect until cancelled or out of retries
    async fn reconnect_loop(
        &self,
        listener: &TcpListener,
        cancel: &CancellationToken,
    ) -> Result<(), ForwardError> {
        let mut failures: u32 = 0;
        loop {
            self.reporter.report(&self.id, SessionState::Connecting, None);

            let err = match self.connect(cancel).await {
                ConnectStep::Cancelled => return Ok(()),
                ConnectStep::Failed(err) => err,
                ConnectStep::Ready(channel) => {
                    failures = 0;
                    self.reporter.report(&self.id, SessionState::Active, None);
                    match self.serve(listener, channel, cancel).await {
                        ServeExit::Cancelled => return Ok(()),
                        ServeExit::ChannelLost(err) => err,
                    }
                }
            };

            failures = failures.saturating_add(1);
            self.reporter.report(&self.id, SessionState::Degraded, Some(&err));
            if !err.kind().is_retryable() || self.retry.is_exhausted(failures) {
                return Err(err);
            }

            let delay = self.retry.delay(failures - 1);
            warn!(
                "Forward {} retry {} in {:?} after: {}",
                self.id, failures, delay, err
            );
            self.reporter.report_retry(&self.id, failures, delay);

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Negotiate a channel; it is kept for the first client that connects
    async fn connect(&self, cancel: &CancellationToken) -> ConnectStep {
        tokio::select! {
            _ = cancel.cancelled() => ConnectStep::Cancelled,
            opened = self.cluster.open_channel(&self.target) => match opened {
                Ok(channel) => ConnectStep::Ready(channel),
                Err(e) => ConnectStep::Failed(e),
            },
        }
    }

    /// Accept clients until cancelled or the remote path breaks
    async fn serve(
        &self,
        listener: &TcpListener,
        standby: BoxedChannel,
        cancel: &CancellationToken,
    ) -> ServeExit {
        let mut standby = Some(standby);
        let mut pairs: JoinSet<PairExit> = JoinSet::new();
        let pair_cancel = cancel.child_token();
        let (opened_tx, mut opened_rx) = watch::channel(0u64);
        let opened_tx = Arc::new(opened_tx);
        // Set while a failed open has left the session Degraded with
        // established pairs still running
        let mut degraded = false;

        let exit = loop {
            tokio::select! {
                _ = cancel.cancelled() => break ServeExit::Cancelled,

                Some(joined) = pairs.join_next(), if !pairs.is_empty() => match joined {
                    Ok(PairExit::RemoteFailed(err)) => break ServeExit::ChannelLost(err),
                    Ok(PairExit::OpenFailed(err)) if pairs.is_empty() => {
                        break ServeExit::ChannelLost(err)
                    }
                    Ok(PairExit::OpenFailed(err)) => {
                        warn!(
                            "Forward {}: dropped new client, keeping {} open connections: {}",
                            self.id,
                            pairs.len(),
                            err
                        );
                        opened_rx.borrow_and_update();
                        degraded = true;
                        self.reporter.report(&self.id, SessionState::Degraded, Some(&err));
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Stream pair task for {} failed: {}", self.id, e),
                },

                Ok(()) = opened_rx.changed(), if degraded => {
                    degraded = false;
                    self.reporter.report(&self.id, SessionState::Active, None);
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        // Disable Nagle's algorithm for low-latency forwarding
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }
                        let pair = StreamPair::new(stream, peer, self.stats.clone())
                            .notify_opens(opened_tx.clone());
                        pairs.spawn(pair.run(
                            self.cluster.clone(),
                            self.target.clone(),
                            standby.take(),
                            pair_cancel.child_token(),
                        ));
                    }
                    Err(e) => {
                        error!("Accept error on {}: {}", self.spec.local_addr(), e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        };

        pair_cancel.cancel();
        let open = pairs.len();
        if open > 0 {
            debug!("Closing {} stream pairs of {}", open, self.id);
        }
        while pairs.join_next().await.is_some() {}
        exit
    }
}

/// Handle to a spawned tunnel session
pub struct SessionHandle {
    id: ForwardId,
    cancel: CancellationToken,
    stats: Arc<parking_lot::RwLock<ForwardStats>>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn id(&self) -> &ForwardId {
        &self.id
    }

    /// Ask the session to close; returns immediately
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Get current statistics
    pub fn stats(&self) -> ForwardStats {
        self.stats.read().clone()
    }

    /// Wait for the session task to end
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!("Session task for {} failed: {}", self.id, e);
        }
    }
}
