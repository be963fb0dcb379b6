use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{ManagedServer, ServerRegistry};
use crate::config::{Config, LifecycleConfig};
use crate::context::Context;
use crate::error::{GatewayError, ManagerError, Result};

/// Owns the configured servers: builds them, connects them with bounded
/// retry, and tears them down.
///
/// Every server in `servers` is also in the registry and vice versa, outside
/// of a running `start`/`stop`.
pub struct ServerManager {
    config: Config,
    registry: Arc<ServerRegistry>,
    servers: DashMap<String, Arc<ManagedServer>>,
    lifecycle: Mutex<()>,
}

impl ServerManager {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: Arc::new(ServerRegistry::new()),
            servers: DashMap::new(),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    fn policy(&self) -> &LifecycleConfig {
        &self.config.lifecycle
    }

    /// Registers every enabled definition and tries to connect each one.
    ///
    /// Bad definitions and servers that never connect are logged and left out
    /// or left disconnected; this only fails if `ctx` is already finished.
    pub async fn start(&self, ctx: &Context) -> Result<()> {
        let _guard = ctx.run(self.lifecycle.lock()).await?;

        let mut fresh = Vec::new();
        for definition in &self.config.servers {
            if !definition.enabled {
                tracing::info!("Skipping disabled server: {}", definition.name);
                continue;
            }
            if self.servers.contains_key(&definition.name) {
                tracing::debug!("Server {} already managed", definition.name);
                continue;
            }

            let server = match ManagedServer::new(definition.clone()) {
                Ok(server) => Arc::new(server),
                Err(e) => {
                    tracing::error!("Failed to create managed server {}: {}", definition.name, e);
                    continue;
                }
            };

            if let Err(e) = self.registry.register(server.clone()) {
                tracing::error!("Failed to register server {}: {}", definition.name, e);
                continue;
            }
            self.servers.insert(definition.name.clone(), server.clone());
            tracing::info!(
                "Registered server: {} ({})",
                definition.name,
                server.transport_type()
            );
            fresh.push(server);
        }

        let deadline = ctx.child_with_timeout(self.policy().start_timeout());
        let attempts = fresh.iter().map(|server| {
            let deadline = &deadline;
            async move {
                if let Err(e) = self.connect_with_retry(deadline, server).await {
                    tracing::error!(
                        "Failed to connect server {} after retries: {}",
                        server.name(),
                        e
                    );
                }
            }
        });
        join_all(attempts).await;

        let ready = fresh.iter().filter(|s| s.is_ready()).count();
        tracing::info!("Started {} of {} servers", ready, fresh.len());
        Ok(())
    }

    /// Connects with up to `max_connect_attempts` tries, sleeping
    /// `attempt * backoff_unit` between them. Expiry of `ctx` ends it early;
    /// a single attempt timing out does not.
    pub async fn connect_with_retry(&self, ctx: &Context, server: &ManagedServer) -> Result<()> {
        let max_attempts = self.policy().max_connect_attempts.max(1);
        let mut last_err = None;

        for attempt in 1..=max_attempts {
            match server.connect(ctx).await {
                Ok(()) => {
                    tracing::info!("Connected to server {}", server.name());
                    return Ok(());
                }
                Err(e) if ctx.is_done() => {
                    return Err(e);
                }
                Err(e) => {
                    if attempt < max_attempts {
                        let backoff = self.policy().backoff_unit() * attempt;
                        tracing::warn!(
                            "Retrying connection to {} in {:?} (attempt {}/{}): {}",
                            server.name(),
                            backoff,
                            attempt,
                            max_attempts,
                            e
                        );
                        ctx.sleep(backoff).await?;
                    }
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(GatewayError::DeadlineExceeded))
    }

    /// Disconnects and unregisters everything under one shared deadline.
    /// Individual failures are logged; the server set is always empty after.
    pub async fn stop(&self, ctx: &Context) -> Result<()> {
        let _guard = ctx.run(self.lifecycle.lock()).await?;
        let deadline = ctx.child_with_timeout(self.policy().stop_timeout());

        let names: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        for name in names {
            let Some((_, server)) = self.servers.remove(&name) else {
                continue;
            };
            if let Err(e) = server.disconnect(&deadline).await {
                tracing::warn!("Error disconnecting server {}: {}", name, e);
            }
            if let Err(e) = self.registry.unregister(&name) {
                tracing::warn!("Error unregistering server {}: {}", name, e);
            }
            tracing::info!("Stopped server {}", name);
        }
        Ok(())
    }

    /// Disconnects (best effort) and reruns the retrying connect for one server.
    pub async fn reconnect_server(&self, ctx: &Context, name: &str) -> Result<()> {
        const OP: &str = "reconnect_server";
        let server = self
            .servers
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ManagerError::not_found(OP, name))?;

        let deadline = ctx.child_with_timeout(self.policy().reconnect_timeout());
        if let Err(e) = server.disconnect(&deadline).await {
            tracing::warn!("Error disconnecting server {}: {}", name, e);
        }
        self.connect_with_retry(&deadline, &server)
            .await
            .map_err(|e| ManagerError::connect_failed(OP, name, e).into())
    }

    pub fn get_server(&self, name: &str) -> Result<Arc<ManagedServer>> {
        self.registry.get(name)
    }

    pub fn list_servers(&self) -> Vec<Arc<ManagedServer>> {
        self.registry.list()
    }

    pub fn list_servers_by_capability(&self, capability: &str) -> Vec<Arc<ManagedServer>> {
        self.registry.list_by_capability(capability)
    }

    /// Adds an already-built server, for embedding and tests.
    pub fn insert_server(&self, server: Arc<ManagedServer>) -> Result<()> {
        self.registry.register(server.clone())?;
        self.servers.insert(server.name().to_string(), server);
        Ok(())
    }
}
