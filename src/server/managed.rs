use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::ServerConfig;
use crate::context::Context;
use crate::error::{GatewayError, Result};
use crate::protocol::{methods, JsonRpcError, Request, Response};
use crate::transport::{create_transport, Transport, TransportType};

/// Id used for the handshake request on every connection.
const HANDSHAKE_ID: i64 = 1;

/// One upstream server: its definition, its transport and its readiness.
///
/// `connect`/`disconnect` serialize on a lifecycle lock held for the whole
/// operation, handshake included. Readers never take that lock.
pub struct ManagedServer {
    name: String,
    config: ServerConfig,
    transport: Arc<dyn Transport>,
    lifecycle: Mutex<()>,
    connected: AtomicBool,
    initialized: AtomicBool,
    capabilities: ArcSwap<Vec<String>>,
    last_used: ArcSwapOption<DateTime<Utc>>,
}

impl ManagedServer {
    /// Builds the server and its (unconnected) transport from a definition.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let transport_config = config.transport_config()?;
        let transport = create_transport(&transport_config, config.request_timeout())?;
        Ok(Self::with_transport(config, transport))
    }

    pub fn with_transport(config: ServerConfig, transport: Arc<dyn Transport>) -> Self {
        let capabilities = dedup(config.capabilities.iter().cloned());
        Self {
            name: config.name.clone(),
            config,
            transport,
            lifecycle: Mutex::new(()),
            connected: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            capabilities: ArcSwap::from_pointee(capabilities),
            last_used: ArcSwapOption::empty(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.config.metadata
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport.transport_type()
    }

    /// Opens the transport and runs the `initialize` handshake.
    ///
    /// Each successful handshake rebuilds the capability set from the
    /// configured capabilities plus what the server advertised this time.
    /// A no-op when already connected and initialized. A handshake answered
    /// with an error object leaves the server connected but not initialized and
    /// returns that error as [`GatewayError::Rpc`]; the next call retries it.
    pub async fn connect(&self, ctx: &Context) -> Result<()> {
        let _guard = ctx.run(self.lifecycle.lock()).await?;
        if self.is_connected() && self.is_initialized() {
            return Ok(());
        }

        self.initialized.store(false, Ordering::SeqCst);
        if let Err(e) = self.transport.connect(ctx).await {
            tracing::warn!("Failed to connect to server {}: {}", self.name, e);
            self.connected.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.connected.store(true, Ordering::SeqCst);
        self.touch();

        match self.handshake(ctx).await {
            Ok(discovered) => {
                let merged = self.config.capabilities.iter().cloned().chain(discovered);
                self.capabilities.store(Arc::new(dedup(merged)));
                self.initialized.store(true, Ordering::SeqCst);
                tracing::info!(
                    "Server {} initialized with capabilities {:?}",
                    self.name,
                    self.capabilities()
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to initialize server {}: {}", self.name, e);
                Err(e)
            }
        }
    }

    /// Sends `initialize` and returns the capability names the server advertised.
    ///
    /// Bounded by the server's request timeout as well as by `ctx`.
    async fn handshake(&self, ctx: &Context) -> Result<Vec<String>> {
        let request = Request::new(HANDSHAKE_ID, methods::INITIALIZE, Some(json!({})));
        let ctx = ctx.child_with_timeout(self.config.request_timeout());
        let raw = self.transport.send_request(&ctx, &request).await?;
        let response: Response = serde_json::from_slice(&raw)?;

        if let Some(error) = response.error {
            return Err(GatewayError::Rpc(error));
        }

        let discovered = response
            .result
            .as_ref()
            .and_then(|r| r.get("capabilities"))
            .and_then(Value::as_object)
            .map(|caps| caps.keys().cloned().collect())
            .unwrap_or_default();
        Ok(discovered)
    }

    pub async fn disconnect(&self, ctx: &Context) -> Result<()> {
        let _guard = ctx.run(self.lifecycle.lock()).await?;
        if !self.connected.load(Ordering::SeqCst) && !self.transport.is_connected() {
            return Ok(());
        }

        self.connected.store(false, Ordering::SeqCst);
        self.initialized.store(false, Ordering::SeqCst);
        self.transport.disconnect(ctx).await
    }

    /// Forwards a request and returns the raw upstream reply.
    ///
    /// Readiness and transport failures come back as an internal-error
    /// envelope rather than an `Err`, so the caller always has a reply to relay.
    pub async fn send_request(&self, ctx: &Context, request: &Request) -> Result<Bytes> {
        self.touch();

        if !(self.is_connected() && self.is_initialized()) {
            return self.error_envelope(
                request,
                JsonRpcError::internal("Server not connected or initialized"),
                "not_ready",
            );
        }

        match self.transport.send_request(ctx, request).await {
            Ok(raw) => Ok(raw),
            Err(e) => {
                tracing::warn!(
                    server = %self.name,
                    method = %request.method,
                    "Upstream request failed: {}",
                    e
                );
                self.error_envelope(request, JsonRpcError::internal(e.to_string()), e.reason())
            }
        }
    }

    fn error_envelope(&self, request: &Request, error: JsonRpcError, reason: &str) -> Result<Bytes> {
        let error = error.with_data(json!({ "server": self.name, "reason": reason }));
        let body = serde_json::to_vec(&Response::failure(request.id.clone(), error))?;
        Ok(Bytes::from(body))
    }

    /// Connected according to both our flag and the transport; a transport
    /// that died underneath us clears the flag here.
    pub fn is_connected(&self) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        if self.transport.is_connected() {
            return true;
        }
        tracing::debug!("Server {} transport went away, marking disconnected", self.name);
        self.connected.store(false, Ordering::SeqCst);
        self.initialized.store(false, Ordering::SeqCst);
        false
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Connected and initialized.
    pub fn is_ready(&self) -> bool {
        self.is_connected() && self.is_initialized()
    }

    pub fn set_capabilities(&self, capabilities: Vec<String>) {
        self.capabilities.store(Arc::new(dedup(capabilities)));
    }

    pub fn capabilities(&self) -> Vec<String> {
        self.capabilities.load().as_ref().clone()
    }

    /// Exact string membership.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.load().iter().any(|c| c == capability)
    }

    pub fn last_used(&self) -> Option<DateTime<Utc>> {
        self.last_used.load_full().map(|t| *t)
    }

    fn touch(&self) {
        self.last_used.store(Some(Arc::new(Utc::now())));
    }
}

impl std::fmt::Debug for ManagedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedServer")
            .field("name", &self.name)
            .field("transport", &self.transport_type())
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

fn dedup(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}
