//! Forward Status Reporting
//!
//! Collects state transitions from every tunnel session and hands out
//! point-in-time snapshots. Transitions are also broadcast as
//! [`ForwardEvent`]s for consumers that want to follow them live.
//!
//! The reporter only observes: nothing here feeds back into the sessions.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::error::{ErrorKind, ForwardError};
use super::session::{ForwardStats, SessionState};
use super::spec::{ForwardId, ForwardSpec};

const EVENT_CAPACITY: usize = 256;

/// Events broadcast to subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ForwardEvent {
    /// A forward moved to a new state
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        forward_id: ForwardId,
        state: SessionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A forward scheduled a reconnect
    #[serde(rename_all = "camelCase")]
    RetryScheduled {
        forward_id: ForwardId,
        attempt: u32,
        delay_ms: u64,
    },
}

/// Status of one forward as seen in a snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardStatus {
    pub spec: ForwardSpec,
    pub state: SessionState,
    pub last_error: Option<ErrorKind>,
    pub last_error_message: Option<String>,
    /// Failed attempts since the forward was last active
    pub retry_count: u32,
    /// Whether the forward has been active at least once
    pub ever_active: bool,
    /// When the forward entered its current state
    pub since: DateTime<Utc>,
    pub stats: ForwardStats,
}

impl ForwardStatus {
    /// A forward that never became active or died on its local port
    pub fn is_failed(&self) -> bool {
        !self.ever_active
            || (self.state == SessionState::Closed && self.last_error == Some(ErrorKind::BindFailed))
    }
}

/// Immutable, point-in-time view of every forward
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub taken_at: DateTime<Utc>,
    pub forwards: BTreeMap<ForwardId, ForwardStatus>,
}

impl StatusSnapshot {
    pub fn get(&self, id: &ForwardId) -> Option<&ForwardStatus> {
        self.forwards.get(id)
    }

    pub fn state(&self, id: &ForwardId) -> Option<SessionState> {
        self.forwards.get(id).map(|s| s.state)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ForwardId, &ForwardStatus)> {
        self.forwards.iter()
    }

    pub fn len(&self) -> usize {
        self.forwards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forwards.is_empty()
    }

    /// Whether every forward is in `state`
    pub fn all_in(&self, state: SessionState) -> bool {
        self.forwards.values().all(|s| s.state == state)
    }

    /// Forwards that never became active or failed to bind
    pub fn failed(&self) -> Vec<&ForwardStatus> {
        self.forwards.values().filter(|s| s.is_failed()).collect()
    }

    pub fn is_healthy(&self) -> bool {
        self.forwards.values().all(|s| !s.is_failed())
    }
}

impl std::fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{:<48} {:<22} {:<10} {:>7} {:>6} {:>12} {:>12}  {}",
            "FORWARD", "LOCAL", "STATE", "RETRIES", "CONNS", "SENT", "RECEIVED", "ERROR"
        )?;
        for (id, status) in &self.forwards {
            let error = match (&status.last_error, &status.last_error_message) {
                (_, Some(message)) => message.clone(),
                (Some(kind), None) => kind.to_string(),
                (None, None) => String::new(),
            };
            writeln!(
                f,
                "{:<48} {:<22} {:<10} {:>7} {:>6} {:>12} {:>12}  {}",
                id.as_str(),
                status.spec.local_addr().to_string(),
                status.state.to_string(),
                status.retry_count,
                status.stats.connection_count,
                status.stats.bytes_sent,
                status.stats.bytes_received,
                error
            )?;
        }
        Ok(())
    }
}

struct Entry {
    spec: ForwardSpec,
    state: SessionState,
    last_error: Option<ErrorKind>,
    last_error_message: Option<String>,
    retry_count: u32,
    ever_active: bool,
    since: DateTime<Utc>,
    stats: Arc<RwLock<ForwardStats>>,
}

impl Entry {
    fn to_status(&self) -> ForwardStatus {
        ForwardStatus {
            spec: self.spec.clone(),
            state: self.state,
            last_error: self.last_error,
            last_error_message: self.last_error_message.clone(),
            retry_count: self.retry_count,
            ever_active: self.ever_active,
            since: self.since,
            stats: self.stats.read().clone(),
        }
    }
}

struct ReporterInner {
    entries: RwLock<BTreeMap<ForwardId, Entry>>,
    events: broadcast::Sender<ForwardEvent>,
}

/// Shared sink for forward state transitions
///
/// Cheap to clone; every clone reports into the same table.
#[derive(Clone)]
pub struct StatusReporter {
    inner: Arc<ReporterInner>,
}

impl StatusReporter {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ReporterInner {
                entries: RwLock::new(BTreeMap::new()),
                events,
            }),
        }
    }

    /// Start tracking a forward in `Idle`, attaching its live counters
    ///
    /// Registering an id again replaces its entry.
    pub fn register(&self, spec: &ForwardSpec, stats: Arc<RwLock<ForwardStats>>) {
        let entry = Entry {
            spec: spec.clone(),
            state: SessionState::Idle,
            last_error: None,
            last_error_message: None,
            retry_count: 0,
            ever_active: false,
            since: Utc::now(),
            stats,
        };
        self.inner.entries.write().insert(spec.id(), entry);
    }

    /// Record a state transition
    ///
    /// Reports for a forward that already reached `Closed` are dropped, so
    /// consumers never see a forward come back after closing.
    pub fn report(&self, id: &ForwardId, state: SessionState, error: Option<&ForwardError>) {
        {
            let mut entries = self.inner.entries.write();
            let Some(entry) = entries.get_mut(id) else {
                warn!("Status report for unknown forward {}", id);
                return;
            };
            if entry.state == SessionState::Closed {
                debug!("Ignoring {} report for closed forward {}", state, id);
                return;
            }

            if entry.state != state {
                info!("Forward {}: {} -> {}", id, entry.state, state);
                entry.since = Utc::now();
            }
            entry.state = state;
            match state {
                SessionState::Active => {
                    entry.ever_active = true;
                    entry.retry_count = 0;
                    entry.last_error = None;
                    entry.last_error_message = None;
                }
                _ => {
                    if let Some(err) = error {
                        entry.last_error = Some(err.kind());
                        entry.last_error_message = Some(err.to_string());
                    }
                }
            }
        }

        // No subscribers is fine
        let _ = self.inner.events.send(ForwardEvent::StatusChanged {
            forward_id: id.clone(),
            state,
            error: error.map(|e| e.to_string()),
        });
    }

    /// Record that a forward will retry after `delay`
    pub fn report_retry(&self, id: &ForwardId, attempt: u32, delay: Duration) {
        {
            let mut entries = self.inner.entries.write();
            match entries.get_mut(id) {
                Some(entry) if entry.state != SessionState::Closed => entry.retry_count = attempt,
                _ => return,
            }
        }
        let _ = self.inner.events.send(ForwardEvent::RetryScheduled {
            forward_id: id.clone(),
            attempt,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        });
    }

    /// Copy of the current status of every forward
    pub fn snapshot(&self) -> StatusSnapshot {
        let entries = self.inner.entries.read();
        StatusSnapshot {
            taken_at: Utc::now(),
            forwards: entries
                .iter()
                .map(|(id, entry)| (id.clone(), entry.to_status()))
                .collect(),
        }
    }

    /// Current state of one forward
    pub fn state(&self, id: &ForwardId) -> Option<SessionState> {
        self.inner.entries.read().get(id).map(|e| e.state)
    }

    /// Follow transitions live
    pub fn subscribe(&self) -> broadcast::Receiver<ForwardEvent> {
        self.inner.events.subscribe()
    }
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReporter")
            .field("forwards", &self.inner.entries.read().len())
            .field("subscribers", &self.inner.events.receiver_count())
            .finish()
    }
}
