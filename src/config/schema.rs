use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::transport::TransportType;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default, rename = "server", alias = "servers")]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// One upstream server definition as it appears in the configuration file.
///
/// Channel parameters are kept flat here, the way users write them; they are
/// checked and folded into a [`TransportConfig`] by [`ServerConfig::transport_config`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub name: String,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Channel parameters for one transport kind, validated once.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportConfig {
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        working_directory: Option<PathBuf>,
    },
    Http {
        url: String,
    },
    WebSocket {
        url: String,
    },
    Unix {
        socket_path: PathBuf,
    },
}

impl TransportConfig {
    pub fn transport_type(&self) -> TransportType {
        match self {
            TransportConfig::Stdio { .. } => TransportType::Stdio,
            TransportConfig::Http { .. } => TransportType::Http,
            TransportConfig::WebSocket { .. } => TransportType::WebSocket,
            TransportConfig::Unix { .. } => TransportType::Unix,
        }
    }
}

/// Settings for [`ConnectionPool`](crate::transport::pool::ConnectionPool).
///
/// Only library code that builds a pool reads these; `mcp-gateway serve`
/// keeps one long-lived transport per managed server and never pools.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_per_type")]
    pub max_per_type: usize,
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
    #[serde(default = "default_error_decay")]
    pub error_decay: f64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,
    #[serde(default = "default_backoff_unit_ms")]
    pub backoff_unit_ms: u64,
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_reconnect_timeout_secs")]
    pub reconnect_timeout_secs: u64,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_transport() -> String {
    "stdio".to_string()
}

fn default_enabled() -> bool {
    true
}

pub(crate) fn default_timeout() -> u64 {
    30
}

fn default_max_per_type() -> usize {
    5
}

fn default_max_idle_secs() -> u64 {
    60
}

fn default_error_decay() -> f64 {
    0.75
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_max_connect_attempts() -> u32 {
    3
}

fn default_backoff_unit_ms() -> u64 {
    1000
}

fn default_start_timeout_secs() -> u64 {
    30
}

fn default_stop_timeout_secs() -> u64 {
    10
}

fn default_reconnect_timeout_secs() -> u64 {
    10
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
            log_format: LogFormat::default(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_type: default_max_per_type(),
            max_idle_secs: default_max_idle_secs(),
            error_decay: default_error_decay(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_connect_attempts: default_max_connect_attempts(),
            backoff_unit_ms: default_backoff_unit_ms(),
            start_timeout_secs: default_start_timeout_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            reconnect_timeout_secs: default_reconnect_timeout_secs(),
        }
    }
}

impl ServerConfig {
    /// A stdio definition with defaults for everything else.
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportType::Stdio.to_string(),
            enabled: true,
            command: Some(command.into()),
            args,
            env: HashMap::new(),
            working_directory: None,
            url: None,
            socket_path: None,
            timeout: default_timeout(),
            capabilities: Vec::new(),
            metadata: Map::new(),
        }
    }

    /// A definition of any kind with no channel parameters filled in.
    pub fn named(name: impl Into<String>, transport: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
            command: None,
            ..Self::stdio(name, "", Vec::new())
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(if self.timeout == 0 {
            default_timeout()
        } else {
            self.timeout
        })
    }

    /// Resolves the flat definition into typed channel parameters.
    ///
    /// Fails with [`ConfigError::UnknownTransport`] for an unrecognised kind and
    /// with [`ConfigError::MissingField`] when the kind's required field is absent.
    pub fn transport_config(&self) -> Result<TransportConfig> {
        let kind: TransportType = self.transport.parse()?;
        let missing = |field| ConfigError::MissingField {
            transport: kind,
            field,
        };

        let config = match kind {
            TransportType::Stdio => {
                let command = non_empty(self.command.as_deref()).ok_or_else(|| missing("command"))?;
                TransportConfig::Stdio {
                    command: command.to_string(),
                    args: self.args.clone(),
                    env: self.env.clone(),
                    working_directory: self.working_directory.clone(),
                }
            }
            TransportType::Http => {
                let url = non_empty(self.url.as_deref()).ok_or_else(|| missing("url"))?;
                check_scheme(&self.name, url, &["http", "https"])?;
                TransportConfig::Http {
                    url: url.trim_end_matches('/').to_string(),
                }
            }
            TransportType::WebSocket => {
                let url = non_empty(self.url.as_deref()).ok_or_else(|| missing("url"))?;
                check_scheme(&self.name, url, &["ws", "wss"])?;
                TransportConfig::WebSocket {
                    url: url.to_string(),
                }
            }
            TransportType::Unix => {
                let socket_path = self
                    .socket_path
                    .clone()
                    .filter(|p| !p.as_os_str().is_empty())
                    .ok_or_else(|| missing("socket_path"))?;
                TransportConfig::Unix { socket_path }
            }
        };
        Ok(config)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn check_scheme(server: &str, raw: &str, allowed: &[&str]) -> Result<()> {
    let parsed = url::Url::parse(raw).map_err(|e| {
        ConfigError::Validation(format!("Server '{server}' has invalid URL '{raw}': {e}"))
    })?;
    if !allowed.contains(&parsed.scheme()) {
        return Err(ConfigError::Validation(format!(
            "Server '{server}' URL scheme '{}' must be one of {allowed:?}",
            parsed.scheme()
        ))
        .into());
    }
    Ok(())
}

impl PoolConfig {
    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl LifecycleConfig {
    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.reconnect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;

    #[test]
    fn test_stdio_requires_command() {
        let cfg = ServerConfig::named("s", "stdio");
        let err = cfg.transport_config().unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Config(ConfigError::MissingField { field: "command", .. })
        ));
    }

    #[test]
    fn test_each_kind_reports_its_missing_field() {
        for (kind, field) in [("http", "url"), ("websocket", "url"), ("unix", "socket_path")] {
            let err = ServerConfig::named("s", kind).transport_config().unwrap_err();
            match err {
                GatewayError::Config(ConfigError::MissingField { field: f, transport }) => {
                    assert_eq!(f, field);
                    assert_eq!(transport.to_string(), kind);
                }
                other => panic!("unexpected error for {kind}: {other}"),
            }
        }
    }

    #[test]
    fn test_unknown_transport_kind() {
        let err = ServerConfig::named("s", "carrier-pigeon")
            .transport_config()
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Config(ConfigError::UnknownTransport(ref k)) if k == "carrier-pigeon"
        ));
    }

    #[test]
    fn test_url_scheme_is_checked_per_kind() {
        let mut cfg = ServerConfig::named("s", "websocket");
        cfg.url = Some("http://localhost:9000".into());
        assert!(cfg.transport_config().is_err());

        cfg.url = Some("ws://localhost:9000/mcp".into());
        assert_eq!(
            cfg.transport_config().unwrap(),
            TransportConfig::WebSocket {
                url: "ws://localhost:9000/mcp".into()
            }
        );

        let mut cfg = ServerConfig::named("h", "http");
        cfg.url = Some("https://example.com/".into());
        assert_eq!(
            cfg.transport_config().unwrap(),
            TransportConfig::Http {
                url: "https://example.com".into()
            }
        );
    }

    #[test]
    fn test_zero_timeout_falls_back_to_default() {
        let mut cfg = ServerConfig::stdio("s", "cat", vec![]);
        cfg.timeout = 0;
        assert_eq!(cfg.request_timeout(), Duration::from_secs(30));
    }
}
