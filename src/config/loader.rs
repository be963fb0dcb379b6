use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use super::schema::{default_timeout, Config};
use crate::error::{ConfigError, Result};

const ENV_PREFIX: &str = "MCP_GATEWAY_";
const LOCAL_CONFIG: &str = "mcp-gateway.toml";

/// Loads the first configuration found in the default locations.
pub fn load_default() -> Result<Config> {
    match default_path() {
        Some(path) => load_from_path(path),
        None => Err(ConfigError::Parse(format!(
            "No configuration found: looked for ./{LOCAL_CONFIG} and the user config directory"
        ))
        .into()),
    }
}

fn default_path() -> Option<PathBuf> {
    let local = PathBuf::from(LOCAL_CONFIG);
    if local.is_file() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|dir| dir.join("mcp-gateway").join("config.toml"))
        .filter(|p| p.is_file())
}

pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(ConfigError::Parse(format!(
            "Failed to read config file {}",
            path.display()
        ))
        .into());
    }

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    finish(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
}

/// Parses an in-memory TOML document, mainly for tests and embedding.
pub fn load_from_str(toml: &str) -> Result<Config> {
    finish(Figment::new().merge(Toml::string(toml)))
}

fn finish(figment: Figment) -> Result<Config> {
    let config: Config = figment
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    let config = normalize(config);
    validate(&config)?;
    apply_env_substitutions(config)
}

fn normalize(mut config: Config) -> Config {
    for server in &mut config.servers {
        if server.transport.trim().is_empty() {
            server.transport = "stdio".to_string();
        }
        if server.timeout == 0 {
            server.timeout = default_timeout();
        }
    }
    config
}

/// Structural checks only; per-kind channel parameters are checked when a
/// managed server is built so one bad definition never blocks the rest.
pub fn validate(config: &Config) -> Result<()> {
    let mut seen = HashSet::new();
    for (i, server) in config.servers.iter().enumerate() {
        if server.name.trim().is_empty() {
            return Err(
                ConfigError::Validation(format!("server {i} missing required field: name")).into(),
            );
        }
        if !seen.insert(server.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate server name: {}",
                server.name
            ))
            .into());
        }
    }

    if config.pool.max_per_type == 0 {
        return Err(
            ConfigError::Validation("pool.max_per_type must be greater than 0".into()).into(),
        );
    }
    if !(0.0..1.0).contains(&config.pool.error_decay) {
        return Err(ConfigError::Validation(
            "pool.error_decay must be in [0.0, 1.0)".into(),
        )
        .into());
    }
    if config.lifecycle.max_connect_attempts == 0 {
        return Err(ConfigError::Validation(
            "lifecycle.max_connect_attempts must be at least 1".into(),
        )
        .into());
    }
    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    for server in &mut config.servers {
        for arg in &mut server.args {
            *arg = substitute_env_vars(arg)?;
        }
        for value in server.env.values_mut() {
            *value = substitute_env_vars(value)?;
        }
        if let Some(command) = &mut server.command {
            *command = substitute_env_vars(command)?;
        }
        if let Some(url) = &mut server.url {
            *url = substitute_env_vars(url)?;
        }
        if let Some(path) = &mut server.socket_path {
            if let Some(raw) = path.to_str() {
                *path = PathBuf::from(substitute_env_vars(raw)?);
            }
        }
    }
    Ok(config)
}

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("valid env pattern"))
}

/// Expands `${VAR}` and `${VAR:-default}` references.
fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();

    for cap in env_pattern().captures_iter(input) {
        let expr = &cap[1];
        let (name, fallback) = match expr.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (expr, None),
        };
        let value = match (std::env::var(name), fallback) {
            (Ok(value), _) => value,
            (Err(_), Some(fallback)) => fallback.to_string(),
            (Err(_), None) => {
                return Err(ConfigError::EnvVar(format!(
                    "Environment variable '{name}' not found"
                ))
                .into())
            }
        };
        result = result.replace(&cap[0], &value);
    }

    Ok(result)
}
