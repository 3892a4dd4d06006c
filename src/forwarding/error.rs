//! Forwarding Error types

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of forwarding failures.
///
/// Resolution-time kinds abort startup, session kinds stay inside their
/// session and only surface through status snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// The requested environment is not declared
    UnknownEnvironment,
    /// The environment declares nothing to forward
    EmptyEnvironment,
    /// Two declarations claim the same local port
    PortConflict,
    /// A port number outside 1-65535
    InvalidPort,
    /// A resource kind that cannot be forwarded
    UnsupportedKind,
    /// A required field is missing or empty
    InvalidDeclaration,
    /// An `extends` chain is broken or cyclic
    InvalidExtends,
    /// The local listener could not be bound
    BindFailed,
    /// The remote channel could not be established or was lost
    ConnectFailed,
    /// The session did not close within the shutdown grace period
    ShutdownTimeout,
}

impl ErrorKind {
    /// Whether a session should retry after this failure
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::ConnectFailed)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::UnknownEnvironment => "unknown-environment",
            ErrorKind::EmptyEnvironment => "empty-environment",
            ErrorKind::PortConflict => "port-conflict",
            ErrorKind::InvalidPort => "invalid-port",
            ErrorKind::UnsupportedKind => "unsupported-kind",
            ErrorKind::InvalidDeclaration => "invalid-declaration",
            ErrorKind::InvalidExtends => "invalid-extends",
            ErrorKind::BindFailed => "bind-failed",
            ErrorKind::ConnectFailed => "connect-failed",
            ErrorKind::ShutdownTimeout => "shutdown-timeout",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForwardError {
    #[error("Unknown environment '{0}'")]
    UnknownEnvironment(String),

    #[error("Environment '{0}' declares no forwards")]
    EmptyEnvironment(String),

    #[error("Local port {port} is claimed by more than one forward: {}", .claimants.join(", "))]
    PortConflict { port: u16, claimants: Vec<String> },

    #[error("{context}: port {port} must be between 1 and 65535")]
    InvalidPort { context: String, port: i64 },

    #[error("{context}: unsupported resource kind '{kind}'")]
    UnsupportedKind { context: String, kind: String },

    #[error("{context}: {reason}")]
    InvalidDeclaration { context: String, reason: String },

    #[error("{context}: {reason}")]
    InvalidExtends { context: String, reason: String },

    #[error("Failed to bind {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

impl ForwardError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ForwardError::UnknownEnvironment(_) => ErrorKind::UnknownEnvironment,
            ForwardError::EmptyEnvironment(_) => ErrorKind::EmptyEnvironment,
            ForwardError::PortConflict { .. } => ErrorKind::PortConflict,
            ForwardError::InvalidPort { .. } => ErrorKind::InvalidPort,
            ForwardError::UnsupportedKind { .. } => ErrorKind::UnsupportedKind,
            ForwardError::InvalidDeclaration { .. } => ErrorKind::InvalidDeclaration,
            ForwardError::InvalidExtends { .. } => ErrorKind::InvalidExtends,
            ForwardError::BindFailed { .. } => ErrorKind::BindFailed,
            ForwardError::ConnectFailed(_) => ErrorKind::ConnectFailed,
            ForwardError::ShutdownTimeout(_) => ErrorKind::ShutdownTimeout,
        }
    }

    /// Map a listener bind error, keeping the hints users need most
    pub fn bind_failed(addr: impl std::fmt::Display, err: &std::io::Error) -> Self {
        let reason = match err.kind() {
            std::io::ErrorKind::AddrInUse => {
                "port already in use, another application may be listening on it".to_string()
            }
            std::io::ErrorKind::PermissionDenied => {
                "permission denied, ports below 1024 require elevated privileges".to_string()
            }
            std::io::ErrorKind::AddrNotAvailable => {
                "address not available on this system".to_string()
            }
            _ => err.to_string(),
        };
        ForwardError::BindFailed {
            addr: addr.to_string(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            ForwardError::UnknownEnvironment("dev".into()).kind(),
            ErrorKind::UnknownEnvironment
        );
        assert_eq!(
            ForwardError::ConnectFailed("refused".into()).kind(),
            ErrorKind::ConnectFailed
        );
        assert!(ErrorKind::ConnectFailed.is_retryable());
        assert!(!ErrorKind::BindFailed.is_retryable());
        assert!(!ErrorKind::InvalidDeclaration.is_retryable());
    }

    #[test]
    fn test_port_conflict_message_names_claimants() {
        let err = ForwardError::PortConflict {
            port: 9000,
            claimants: vec!["dev/ns1/service/api".into(), "dev/ns2/pod/web".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("9000"));
        assert!(msg.contains("dev/ns1/service/api"));
        assert!(msg.contains("dev/ns2/pod/web"));
    }

    #[test]
    fn test_bind_failed_addr_in_use() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let err = ForwardError::bind_failed("127.0.0.1:8080", &io);
        assert_eq!(err.kind(), ErrorKind::BindFailed);
        assert!(err.to_string().contains("already in use"));
    }

    #[test]
    fn test_error_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::ConnectFailed).unwrap();
        assert_eq!(json, "\"connectFailed\"");
    }
}
