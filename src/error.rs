use std::fmt;
use std::io;
use thiserror::Error;

use crate::protocol::JsonRpcError;
use crate::transport::TransportType;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Upstream error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Operation cancelled")]
    Cancelled,
}

impl GatewayError {
    /// True when the failure came from an expired deadline rather than the upstream.
    pub fn is_timeout(&self) -> bool {
        match self {
            GatewayError::DeadlineExceeded => true,
            GatewayError::Manager(e) => e.kind == ManagerErrorKind::DeadlineExceeded,
            _ => false,
        }
    }

    /// Short machine-readable tag, used as `data.reason` in synthesized error envelopes.
    pub fn reason(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "config",
            GatewayError::Transport(TransportError::NotConnected) => "not_connected",
            GatewayError::Transport(_) => "transport",
            GatewayError::Registry(_) => "registry",
            GatewayError::Manager(_) => "manager",
            GatewayError::Pool(_) => "pool_exhausted",
            GatewayError::Rpc(_) => "upstream",
            GatewayError::Io(_) => "io",
            GatewayError::Serialization(_) => "serialization",
            GatewayError::DeadlineExceeded => "deadline_exceeded",
            GatewayError::Cancelled => "cancelled",
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unknown transport type: {0}")]
    UnknownTransport(String),

    #[error("{transport} transport requires '{field}' configuration")]
    MissingField {
        transport: TransportType,
        field: &'static str,
    },

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Transport closed")]
    Closed,

    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("server {0} already registered")]
    AlreadyRegistered(String),

    #[error("server {0} not registered")]
    NotRegistered(String),

    #[error("server {0} not found")]
    NotFound(String),
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("connection pool exhausted for transport type {0}")]
    Exhausted(TransportType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerErrorKind {
    NotFound,
    ConnectFailed,
    DeadlineExceeded,
    Cancelled,
}

impl fmt::Display for ManagerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ManagerErrorKind::NotFound => "not found",
            ManagerErrorKind::ConnectFailed => "connect failed",
            ManagerErrorKind::DeadlineExceeded => "deadline exceeded",
            ManagerErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
#[error("{op} {name}: {kind}")]
pub struct ManagerError {
    pub kind: ManagerErrorKind,
    pub op: &'static str,
    pub name: String,
    #[source]
    pub source: Option<Box<GatewayError>>,
}

impl ManagerError {
    pub fn not_found(op: &'static str, name: impl Into<String>) -> Self {
        Self {
            kind: ManagerErrorKind::NotFound,
            op,
            name: name.into(),
            source: None,
        }
    }

    /// Wraps the last connect failure, classifying deadline and cancellation separately.
    pub fn connect_failed(op: &'static str, name: impl Into<String>, cause: GatewayError) -> Self {
        let kind = match cause {
            GatewayError::DeadlineExceeded => ManagerErrorKind::DeadlineExceeded,
            GatewayError::Cancelled => ManagerErrorKind::Cancelled,
            _ => ManagerErrorKind::ConnectFailed,
        };
        Self {
            kind,
            op,
            name: name.into(),
            source: Some(Box::new(cause)),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_error_display_and_kind() {
        let err = ManagerError::not_found("reconnect_server", "alpha");
        assert_eq!(err.to_string(), "reconnect_server alpha: not found");
        assert_eq!(err.kind, ManagerErrorKind::NotFound);

        let err = ManagerError::connect_failed("start", "beta", GatewayError::DeadlineExceeded);
        assert_eq!(err.kind, ManagerErrorKind::DeadlineExceeded);
        assert!(GatewayError::from(err).is_timeout());
    }

    #[test]
    fn test_missing_field_names_offending_field() {
        let err = ConfigError::MissingField {
            transport: TransportType::Unix,
            field: "socket_path",
        };
        assert_eq!(
            err.to_string(),
            "unix transport requires 'socket_path' configuration"
        );
    }
}
