//! Forward Supervisor
//!
//! Runs one [`TunnelSession`] per resolved spec and tears them all down on
//! shutdown. The supervisor owns the session registry for the duration of
//! [`ForwardSupervisor::run`]; nothing about running forwards is global.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::backoff::RetryConfig;
use super::error::ForwardError;
use super::events::{StatusReporter, StatusSnapshot};
use super::session::{SessionState, TunnelSession};
use super::spec::{ForwardId, ForwardSpec};
use crate::cluster::{ClusterSession, ClusterSessionFactory, ContextSession};
use crate::config::EngineSettings;

/// Supervisor tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Reconnect policy handed to every session
    pub retry: RetryConfig,
    /// How long shutdown waits for sessions to close
    pub shutdown_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl From<&EngineSettings> for SupervisorConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            retry: settings.retry_config(),
            shutdown_grace: settings.shutdown_grace(),
        }
    }
}

/// Why [`ForwardSupervisor::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The shutdown signal fired
    ShutdownRequested,
    /// Every session closed without being asked to
    AllSessionsClosed,
}

/// Outcome of a supervised run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub exit: RunExit,
    /// Sessions abandoned after the grace timeout
    pub shutdown_timeouts: Vec<ForwardId>,
    /// Final status of every forward
    pub snapshot: StatusSnapshot,
}

impl RunReport {
    /// Clean shutdown with every forward having been active
    ///
    /// Sessions abandoned on shutdown do not count against success.
    pub fn is_success(&self) -> bool {
        self.exit == RunExit::ShutdownRequested && self.snapshot.is_healthy()
    }

    pub fn exit_code(&self) -> u8 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

/// Lifecycle owner of all tunnel sessions of one run
pub struct ForwardSupervisor {
    factory: Arc<dyn ClusterSessionFactory>,
    config: SupervisorConfig,
    reporter: StatusReporter,
    /// Running sessions by identity
    sessions: HashMap<ForwardId, CancellationToken>,
    cancel: CancellationToken,
}

impl ForwardSupervisor {
    pub fn new(factory: Arc<dyn ClusterSessionFactory>, config: SupervisorConfig) -> Self {
        Self {
            factory,
            config,
            reporter: StatusReporter::new(),
            sessions: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Reporter the sessions of this supervisor report into
    pub fn reporter(&self) -> StatusReporter {
        self.reporter.clone()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.reporter.snapshot()
    }

    /// Token that stops [`run`](Self::run) the same way the shutdown future does
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run every spec until `shutdown` resolves or all sessions have closed
    pub async fn run<F>(mut self, specs: Vec<ForwardSpec>, shutdown: F) -> RunReport
    where
        F: Future<Output = ()>,
    {
        let mut tasks: JoinSet<ForwardId> = JoinSet::new();
        self.spawn_sessions(specs, &mut tasks);

        let root = self.cancel.clone();
        tokio::pin!(shutdown);
        let exit = loop {
            tokio::select! {
                _ = &mut shutdown => break RunExit::ShutdownRequested,
                _ = root.cancelled() => break RunExit::ShutdownRequested,
                joined = tasks.join_next() => match joined {
                    Some(Ok(id)) => {
                        self.sessions.remove(&id);
                    }
                    Some(Err(e)) => error!("Session task failed: {}", e),
                    None => break RunExit::AllSessionsClosed,
                },
            }
        };

        let shutdown_timeouts = match exit {
            RunExit::ShutdownRequested => self.stop_all(&mut tasks).await,
            RunExit::AllSessionsClosed => {
                warn!("All forwards closed on their own");
                Vec::new()
            }
        };

        RunReport {
            exit,
            shutdown_timeouts,
            snapshot: self.reporter.snapshot(),
        }
    }

    fn spawn_sessions(&mut self, specs: Vec<ForwardSpec>, tasks: &mut JoinSet<ForwardId>) {
        let shared = self.factory.shares_sessions();
        let mut contexts: HashMap<String, Arc<dyn ClusterSession>> = HashMap::new();
        info!("Starting {} forwards", specs.len());

        for spec in specs {
            let id = spec.id();
            if self.sessions.contains_key(&id) {
                warn!("Forward {} declared twice, ignoring duplicate", id);
                continue;
            }

            let cluster: Arc<dyn ClusterSession> = if shared {
                contexts
                    .entry(spec.context.clone())
                    .or_insert_with(|| {
                        Arc::new(ContextSession::new(spec.context.clone(), self.factory.clone()))
                    })
                    .clone()
            } else {
                Arc::new(ContextSession::new(spec.context.clone(), self.factory.clone()))
            };

            let session = TunnelSession::new(
                spec,
                cluster,
                self.config.retry.clone(),
                self.reporter.clone(),
            );
            let token = self.cancel.child_token();
            self.sessions.insert(id.clone(), token.clone());
            tasks.spawn(async move {
                session.run(token).await;
                id
            });
        }
    }

    /// Stop all sessions and wait for them within the grace period
    ///
    /// Returns the sessions that had to be abandoned.
    async fn stop_all(&mut self, tasks: &mut JoinSet<ForwardId>) -> Vec<ForwardId> {
        let grace = self.config.shutdown_grace;
        info!("Stopping {} forwards", self.sessions.len());
        for token in self.sessions.values() {
            token.cancel();
        }
        self.cancel.cancel();

        let sessions = &mut self.sessions;
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(id) => {
                        sessions.remove(&id);
                    }
                    Err(e) => error!("Session task failed: {}", e),
                }
            }
        })
        .await;

        let mut abandoned = Vec::new();
        if drained.is_err() {
            tasks.abort_all();
            let err = ForwardError::ShutdownTimeout(grace);
            for id in self.sessions.keys() {
                if self.reporter.state(id) != Some(SessionState::Closed) {
                    warn!("Forward {}: {}", id, err);
                    self.reporter.report(id, SessionState::Closed, Some(&err));
                    abandoned.push(id.clone());
                }
            }
            abandoned.sort();
            // Aborted tasks stuck outside an await point are left behind
            tasks.detach_all();
        }
        self.sessions.clear();
        abandoned
    }
}

impl std::fmt::Debug for ForwardSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardSupervisor")
            .field("config", &self.config)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::{free_port, wait_until, CountingFactory, EchoCluster, FailingCluster};
    use crate::cluster::{BoxedChannel, ChannelTarget};
    use crate::forwarding::{ErrorKind, ResourceKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(5);

    fn spec(context: &str, name: &str, local_port: u16) -> ForwardSpec {
        ForwardSpec::new(context, "ns1", ResourceKind::Service, name, local_port, 80)
    }

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            retry: RetryConfig::default()
                .with_backoff(Duration::from_millis(5), Duration::from_millis(20)),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    fn all_active(reporter: &StatusReporter, count: usize) -> bool {
        let snapshot = reporter.snapshot();
        snapshot.len() == count && snapshot.all_in(SessionState::Active)
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_session() {
        let echo = EchoCluster::start().await;
        let factory = Arc::new(CountingFactory::new(echo));
        let supervisor = ForwardSupervisor::new(factory, fast_config());
        let reporter = supervisor.reporter();
        let stop = CancellationToken::new();

        let specs = vec![spec("dev-ctx", "api", free_port()), spec("dev-ctx", "web", free_port())];
        let run = tokio::spawn(supervisor.run(specs, stop.clone().cancelled_owned()));

        assert!(wait_until(WAIT, || all_active(&reporter, 2)).await);
        stop.cancel();

        let report = tokio::time::timeout(WAIT, run).await.unwrap().unwrap();
        assert_eq!(report.exit, RunExit::ShutdownRequested);
        assert!(report.shutdown_timeouts.is_empty());
        assert_eq!(report.snapshot.len(), 2);
        assert!(report.snapshot.all_in(SessionState::Closed));
        assert!(report.is_success());
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_token_stops_run() {
        let echo = EchoCluster::start().await;
        let supervisor = ForwardSupervisor::new(Arc::new(CountingFactory::new(echo)), fast_config());
        let reporter = supervisor.reporter();
        let token = supervisor.shutdown_token();

        let run = tokio::spawn(supervisor.run(
            vec![spec("dev-ctx", "api", free_port())],
            std::future::pending(),
        ));
        assert!(wait_until(WAIT, || all_active(&reporter, 1)).await);
        token.cancel();

        let report = tokio::time::timeout(WAIT, run).await.unwrap().unwrap();
        assert_eq!(report.exit, RunExit::ShutdownRequested);
        assert!(reporter.snapshot().all_in(SessionState::Closed));
    }

    #[tokio::test]
    async fn test_bind_failure_does_not_stop_siblings() {
        let echo = EchoCluster::start().await;
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = occupied.local_addr().unwrap().port();
        let supervisor = ForwardSupervisor::new(Arc::new(CountingFactory::new(echo)), fast_config());
        let reporter = supervisor.reporter();
        let stop = CancellationToken::new();

        let healthy = spec("dev-ctx", "api", free_port());
        let blocked = spec("dev-ctx", "web", taken);
        let run = tokio::spawn(supervisor.run(
            vec![healthy.clone(), blocked.clone()],
            stop.clone().cancelled_owned(),
        ));

        assert!(
            wait_until(WAIT, || {
                reporter.state(&healthy.id()) == Some(SessionState::Active)
                    && reporter.state(&blocked.id()) == Some(SessionState::Closed)
            })
            .await
        );
        stop.cancel();

        let report = tokio::time::timeout(WAIT, run).await.unwrap().unwrap();
        let failed = report.snapshot.failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].spec.local_port, taken);
        assert_eq!(failed[0].last_error, Some(ErrorKind::BindFailed));
        assert!(report.snapshot.get(&healthy.id()).unwrap().ever_active);
        assert!(!report.is_success());
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_sessions_share_one_cluster_session_per_context() {
        let echo = EchoCluster::start().await;
        let factory = Arc::new(CountingFactory::new(echo));
        let supervisor = ForwardSupervisor::new(factory.clone(), fast_config());
        let reporter = supervisor.reporter();
        let stop = CancellationToken::new();

        let specs = vec![
            spec("dev-ctx", "api", free_port()),
            spec("dev-ctx", "web", free_port()),
            spec("dev-ctx", "db", free_port()),
        ];
        let run = tokio::spawn(supervisor.run(specs, stop.clone().cancelled_owned()));
        assert!(wait_until(WAIT, || all_active(&reporter, 3)).await);
        stop.cancel();
        tokio::time::timeout(WAIT, run).await.unwrap().unwrap();

        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn test_unshared_factory_gets_session_per_spec() {
        let echo = EchoCluster::start().await;
        let factory = Arc::new(CountingFactory::new(echo).not_shared());
        let supervisor = ForwardSupervisor::new(factory.clone(), fast_config());
        let reporter = supervisor.reporter();
        let stop = CancellationToken::new();

        let specs = vec![spec("dev-ctx", "api", free_port()), spec("dev-ctx", "web", free_port())];
        let run = tokio::spawn(supervisor.run(specs, stop.clone().cancelled_owned()));
        assert!(wait_until(WAIT, || all_active(&reporter, 2)).await);
        stop.cancel();
        tokio::time::timeout(WAIT, run).await.unwrap().unwrap();

        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn test_run_returns_when_all_sessions_close() {
        let config = SupervisorConfig {
            retry: RetryConfig::default()
                .with_backoff(Duration::from_millis(1), Duration::from_millis(2))
                .with_max_retries(0),
            ..fast_config()
        };
        let supervisor =
            ForwardSupervisor::new(Arc::new(CountingFactory::new(FailingCluster::new())), config);

        let specs = vec![spec("dev-ctx", "api", free_port()), spec("dev-ctx", "web", free_port())];
        let report = tokio::time::timeout(WAIT, supervisor.run(specs, std::future::pending()))
            .await
            .unwrap();

        assert_eq!(report.exit, RunExit::AllSessionsClosed);
        assert!(report.snapshot.all_in(SessionState::Closed));
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn test_empty_spec_set_returns_immediately() {
        let supervisor = ForwardSupervisor::new(
            Arc::new(CountingFactory::new(FailingCluster::new())),
            fast_config(),
        );
        let report = supervisor.run(Vec::new(), std::future::pending()).await;
        assert_eq!(report.exit, RunExit::AllSessionsClosed);
        assert!(report.snapshot.is_empty());
    }

    /// Blocks its worker thread inside the handshake, ignoring cancellation
    #[derive(Clone, Default)]
    struct StuckCluster {
        entered: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ClusterSession for StuckCluster {
        async fn open_channel(&self, target: &ChannelTarget) -> Result<BoxedChannel, ForwardError> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_secs(1));
            Err(ForwardError::ConnectFailed(format!("{} timed out", target)))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stuck_session_reported_as_shutdown_timeout() {
        let stuck = StuckCluster::default();
        let config = SupervisorConfig {
            shutdown_grace: Duration::from_millis(50),
            ..fast_config()
        };
        let supervisor = ForwardSupervisor::new(Arc::new(CountingFactory::new(stuck.clone())), config);
        let stop = CancellationToken::new();
        let target = spec("dev-ctx", "api", free_port());

        let run = tokio::spawn(supervisor.run(vec![target.clone()], stop.clone().cancelled_owned()));
        assert!(wait_until(WAIT, || stuck.entered.load(Ordering::SeqCst) >= 1).await);
        let stopped_at = tokio::time::Instant::now();
        stop.cancel();

        let report = tokio::time::timeout(WAIT, run).await.unwrap().unwrap();
        // Returns after the grace period without waiting for the stuck task
        assert!(stopped_at.elapsed() < Duration::from_millis(500));
        assert_eq!(report.shutdown_timeouts, vec![target.id()]);
        let status = report.snapshot.get(&target.id()).unwrap();
        assert_eq!(status.state, SessionState::Closed);
        assert_eq!(status.last_error, Some(ErrorKind::ShutdownTimeout));
    }
}
