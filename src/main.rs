use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{debug, error, info, warn};

use mcp_gateway::commands;
use mcp_gateway::config::{self, Config};
use mcp_gateway::context::Context;
use mcp_gateway::logging;
use mcp_gateway::router::Router;
use mcp_gateway::server::ServerManager;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve newline-delimited JSON-RPC on stdin/stdout (default)
    Serve,
    /// Connect to every enabled server once and report the result
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => config::load_from_path(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => config::load_default().context("failed to load config")?,
    };

    let _guard = logging::init(&config.gateway, args.debug).context("failed to set up logging")?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Check => check(config).await,
    }
}

async fn check(config: Config) -> anyhow::Result<()> {
    let checks = commands::run_config_check(config).await?;
    print!("{}", commands::render_report(&checks));

    let failed = checks.iter().filter(|c| !c.passed()).count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} server(s) failed the check", checks.len());
    }
    println!("All {} server(s) passed", checks.len());
    Ok(())
}

async fn serve(config: Config) -> anyhow::Result<()> {
    config::validate(&config).context("configuration is invalid")?;
    info!("Starting MCP gateway with {} server definition(s)", config.servers.len());

    let manager = Arc::new(ServerManager::new(config));
    let root = Context::background();
    manager.start(&root).await.context("failed to start servers")?;

    let router = Router::new(manager.clone());
    info!("Gateway ready - reading from stdin, writing to stdout");

    tokio::select! {
        res = stdio_loop(&router, &root) => {
            if let Err(e) = res {
                error!("Stdio loop failed: {:#}", e);
            }
            info!("Stdin closed, shutting down");
        }
        _ = shutdown_signal() => {}
    }

    root.cancel();
    manager
        .stop(&Context::background())
        .await
        .context("failed to stop servers")?;
    info!("Gateway stopped");
    Ok(())
}

async fn stdio_loop(router: &Router, root: &Context) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        debug!("Received: {}", line);

        let Some(response) = router.handle_line(root, &line).await else {
            continue;
        };
        let json = match serde_json::to_string(&response) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize response: {}", e);
                continue;
            }
        };
        stdout.write_all(json.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
