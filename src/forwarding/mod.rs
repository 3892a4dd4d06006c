//! Port Forwarding Engine
//!
//! Resolves forward declarations from the configuration into
//! [`ForwardSpec`]s and keeps one reconnecting tunnel per spec alive under a
//! [`ForwardSupervisor`]. Progress is observable through the
//! [`StatusReporter`].

mod backoff;
pub mod environment;
mod error;
mod events;
mod relay;
pub mod session;
pub mod spec;
pub mod supervisor;

pub use backoff::RetryConfig;
pub use environment::{effective_environment, EffectiveEnvironment};
pub use error::{ErrorKind, ForwardError};
pub use events::{ForwardEvent, ForwardStatus, StatusReporter, StatusSnapshot};
pub use session::{ForwardStats, SessionHandle, SessionState, TunnelSession};
pub use spec::{resolve, ForwardId, ForwardSpec, ResourceKind, DEFAULT_BIND_ADDRESS};
pub use supervisor::{ForwardSupervisor, RunExit, RunReport, SupervisorConfig};
