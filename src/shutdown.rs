//! Shutdown signal handling: INT or TERM stops a running supervisor.

use std::io;

/// Signal that triggered the shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Interrupt => f.write_str("SIGINT"),
            Signal::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Wait for SIGINT or SIGTERM
#[cfg(unix)]
pub async fn wait_signal() -> io::Result<Signal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;

    let kind = tokio::select! {
        _ = sig_int.recv() => Signal::Interrupt,
        _ = sig_term.recv() => Signal::Terminate,
    };
    tracing::warn!(signal = %kind, "Signalled");
    Ok(kind)
}

/// Wait for Ctrl-C
#[cfg(not(unix))]
pub async fn wait_signal() -> io::Result<Signal> {
    tokio::signal::ctrl_c().await?;
    tracing::warn!(signal = %Signal::Interrupt, "Signalled");
    Ok(Signal::Interrupt)
}

/// Resolves once a shutdown signal arrives
///
/// If the handlers cannot be installed the error is logged and the future
/// never resolves, leaving the caller's other exit paths in charge.
pub async fn wait() {
    match wait_signal().await {
        Ok(_) => {}
        Err(e) => {
            tracing::error!("Failed to install signal handlers: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
