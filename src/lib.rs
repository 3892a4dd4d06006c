//! kubeforward - keeps Kubernetes port-forwards alive
//!
//! Resolves the forwards declared for an environment, runs one reconnecting
//! tunnel per forward and reports their status.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod forwarding;
pub mod shutdown;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber
///
/// Defaults to `info`; `RUST_LOG` overrides.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
