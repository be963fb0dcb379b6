use anyhow::Context as _;
use tracing::{error, info};

use crate::config::Config;
use crate::context::Context;
use crate::server::{ManagedServer, ServerManager};

/// Outcome of `mcp-gateway check` for one enabled server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCheck {
    pub name: String,
    pub transport: String,
    pub connected: bool,
    pub initialized: bool,
    pub capabilities: Vec<String>,
}

impl ServerCheck {
    fn from_server(server: &ManagedServer) -> Self {
        Self {
            name: server.name().to_string(),
            transport: server.transport_type().to_string(),
            connected: server.is_connected(),
            initialized: server.is_initialized(),
            capabilities: server.capabilities(),
        }
    }

    pub fn passed(&self) -> bool {
        self.connected && self.initialized
    }
}

/// Starts every enabled server once, reports on each, and stops them again.
///
/// Enabled definitions that could not even be built count as failures.
pub async fn run_config_check(config: Config) -> anyhow::Result<Vec<ServerCheck>> {
    info!("Checking configuration...");
    crate::config::validate(&config).context("configuration is invalid")?;

    let enabled: Vec<String> = config
        .servers
        .iter()
        .filter(|s| s.enabled)
        .map(|s| s.name.clone())
        .collect();
    info!("Checking {} enabled server(s)...", enabled.len());

    let manager = ServerManager::new(config);
    let ctx = Context::background();
    manager.start(&ctx).await.context("failed to start servers")?;

    let mut checks = Vec::with_capacity(enabled.len());
    for name in &enabled {
        let check = match manager.get_server(name) {
            Ok(server) => ServerCheck::from_server(&server),
            Err(e) => {
                error!("Server {} was not started: {}", name, e);
                ServerCheck {
                    name: name.clone(),
                    transport: String::from("-"),
                    connected: false,
                    initialized: false,
                    capabilities: Vec::new(),
                }
            }
        };
        checks.push(check);
    }

    manager.stop(&ctx).await.context("failed to stop servers")?;
    Ok(checks)
}

/// One line per server, for the terminal.
pub fn render_report(checks: &[ServerCheck]) -> String {
    let mut out = String::new();
    for check in checks {
        let mark = if check.passed() { "✓" } else { "✗" };
        out.push_str(&format!(
            "{mark} {} [{}] connected={} initialized={} capabilities=[{}]\n",
            check.name,
            check.transport,
            check.connected,
            check.initialized,
            check.capabilities.join(", ")
        ));
    }
    out
}
