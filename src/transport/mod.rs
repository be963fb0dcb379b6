use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::TransportConfig;
use crate::context::Context;
use crate::error::{ConfigError, Result};
use crate::protocol::Request;

pub mod http;
pub mod pool;
pub mod stdio;
mod stream;
#[cfg(unix)]
pub mod unix;
pub mod websocket;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportType {
    Stdio,
    Http,
    WebSocket,
    Unix,
}

impl TransportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Stdio => "stdio",
            TransportType::Http => "http",
            TransportType::WebSocket => "websocket",
            TransportType::Unix => "unix",
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportType {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "stdio" => Ok(TransportType::Stdio),
            "http" => Ok(TransportType::Http),
            "websocket" => Ok(TransportType::WebSocket),
            "unix" => Ok(TransportType::Unix),
            other => Err(ConfigError::UnknownTransport(other.to_string())),
        }
    }
}

/// One connection to one upstream endpoint.
///
/// `connect` and `disconnect` are idempotent. `send_request` returns the raw
/// bytes of the upstream reply; streaming kinds carry one exchange at a time.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, ctx: &Context) -> Result<()>;
    async fn disconnect(&self, ctx: &Context) -> Result<()>;
    async fn send_request(&self, ctx: &Context, request: &Request) -> Result<Bytes>;
    fn is_connected(&self) -> bool;
    fn transport_type(&self) -> TransportType;
}

/// Builds an unconnected transport for the given channel parameters.
pub fn create_transport(config: &TransportConfig, timeout: Duration) -> Result<Arc<dyn Transport>> {
    match config {
        TransportConfig::Stdio {
            command,
            args,
            env,
            working_directory,
        } => {
            let mut transport = stdio::StdioTransport::new(command.clone(), args.clone());
            if !env.is_empty() {
                transport = transport.with_env(env.clone());
            }
            if let Some(dir) = working_directory {
                transport = transport.with_working_dir(dir.clone());
            }
            Ok(Arc::new(transport))
        }
        TransportConfig::Http { url } => {
            Ok(Arc::new(http::HttpTransport::new(url.clone(), timeout)))
        }
        TransportConfig::WebSocket { url } => Ok(Arc::new(websocket::WebSocketTransport::new(
            url.clone(),
            timeout,
        ))),
        #[cfg(unix)]
        TransportConfig::Unix { socket_path } => Ok(Arc::new(unix::UnixSocketTransport::new(
            socket_path.clone(),
        ))),
        #[cfg(not(unix))]
        TransportConfig::Unix { .. } => Err(ConfigError::Validation(
            "unix transport is not supported on this platform".into(),
        )
        .into()),
    }
}

/// Same-identity check for transports held behind `Arc<dyn Transport>`.
pub(crate) fn same_transport(a: &Arc<dyn Transport>, b: &Arc<dyn Transport>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_transport_type_round_trips_names() {
        for kind in [
            TransportType::Stdio,
            TransportType::Http,
            TransportType::WebSocket,
            TransportType::Unix,
        ] {
            assert_eq!(kind.as_str().parse::<TransportType>().unwrap(), kind);
        }
        assert!("tcp".parse::<TransportType>().is_err());
    }

    #[tokio::test]
    async fn test_factory_builds_each_kind_unconnected() {
        let configs = vec![
            TransportConfig::Stdio {
                command: "cat".into(),
                args: vec![],
                env: HashMap::new(),
                working_directory: None,
            },
            TransportConfig::Http {
                url: "http://127.0.0.1:1".into(),
            },
            TransportConfig::WebSocket {
                url: "ws://127.0.0.1:1".into(),
            },
            TransportConfig::Unix {
                socket_path: "/tmp/does-not-exist.sock".into(),
            },
        ];

        for config in configs {
            let transport = create_transport(&config, Duration::from_secs(1)).unwrap();
            assert_eq!(transport.transport_type(), config.transport_type());
            assert!(!transport.is_connected());
        }
    }

    #[tokio::test]
    async fn test_send_before_connect_is_not_connected() {
        let transport = create_transport(
            &TransportConfig::Http {
                url: "http://127.0.0.1:1".into(),
            },
            Duration::from_secs(1),
        )
        .unwrap();
        let err = transport
            .send_request(&Context::background(), &Request::new(1, "ping", None))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::GatewayError::Transport(crate::error::TransportError::NotConnected)
        ));
    }

    #[test]
    fn test_same_transport_identity() {
        let a = create_transport(
            &TransportConfig::Http {
                url: "http://127.0.0.1:1".into(),
            },
            Duration::from_secs(1),
        )
        .unwrap();
        let b = create_transport(
            &TransportConfig::Http {
                url: "http://127.0.0.1:1".into(),
            },
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(same_transport(&a, &a.clone()));
        assert!(!same_transport(&a, &b));
    }
}
