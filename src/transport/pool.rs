use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{create_transport, same_transport, Transport, TransportType};
use crate::config::{PoolConfig, TransportConfig};
use crate::context::Context;
use crate::error::{GatewayError, PoolError, Result};

/// Entries at or below this score are skipped when handing out transports.
pub const REUSE_THRESHOLD: f64 = 0.5;

/// How long a handed-out transport may stay unconnected before a scan evicts it.
pub const CONNECT_GRACE: Duration = Duration::from_secs(30);

struct PooledTransport {
    transport: Arc<dyn Transport>,
    created_at: Instant,
    last_used: Instant,
    health_score: f64,
    last_error: Option<String>,
    request_count: u64,
    was_connected: bool,
}

impl PooledTransport {
    fn new(transport: Arc<dyn Transport>) -> Self {
        let now = Instant::now();
        Self {
            transport,
            created_at: now,
            last_used: now,
            health_score: 1.0,
            last_error: None,
            request_count: 0,
            was_connected: false,
        }
    }

    /// Dead after having been connected, or never connected within the grace period.
    fn is_stale(&mut self, now: Instant) -> bool {
        if self.transport.is_connected() {
            self.was_connected = true;
            return false;
        }
        self.was_connected || now.duration_since(self.created_at) > CONNECT_GRACE
    }

    fn is_reusable(&self) -> bool {
        self.transport.is_connected() && self.health_score > REUSE_THRESHOLD
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TypeStats {
    pub total: usize,
    pub connected: usize,
    pub available: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_transports: usize,
    pub connected: usize,
    pub disconnected: usize,
    pub by_type: BTreeMap<String, TypeStats>,
    pub max_per_type: usize,
    pub max_idle: Duration,
}

/// Per-kind pool of transports with a health score driving reuse.
///
/// The pool never connects what it creates; callers connect a fresh transport
/// themselves and report the outcome of each use through `return_transport`.
pub struct ConnectionPool {
    config: PoolConfig,
    entries: RwLock<HashMap<TransportType, Vec<PooledTransport>>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Hands out a healthy connected transport of the config's kind, or a new
    /// unconnected one while the kind is below its limit.
    pub async fn get_transport(
        &self,
        config: &TransportConfig,
        timeout: Duration,
    ) -> Result<Arc<dyn Transport>> {
        let kind = config.transport_type();
        let mut entries = self.entries.write().await;
        let slot = entries.entry(kind).or_default();

        let before = slot.len();
        let now = Instant::now();
        slot.retain_mut(|pooled| !pooled.is_stale(now));
        if slot.len() < before {
            tracing::debug!(
                transport = %kind,
                evicted = before - slot.len(),
                "Evicted disconnected pooled transports"
            );
        }

        if let Some(pooled) = slot.iter_mut().find(|p| p.is_reusable()) {
            pooled.last_used = Instant::now();
            pooled.request_count += 1;
            return Ok(pooled.transport.clone());
        }

        if slot.len() >= self.config.max_per_type {
            return Err(PoolError::Exhausted(kind).into());
        }

        let transport = create_transport(config, timeout)?;
        slot.push(PooledTransport::new(transport.clone()));
        tracing::debug!(transport = %kind, size = slot.len(), "Created pooled transport");
        Ok(transport)
    }

    /// Records the outcome of one use. Unknown transports are ignored.
    pub async fn return_transport(&self, transport: &Arc<dyn Transport>, err: Option<&GatewayError>) {
        let mut entries = self.entries.write().await;
        let Some(pooled) = entries
            .values_mut()
            .flat_map(|slot| slot.iter_mut())
            .find(|p| same_transport(&p.transport, transport))
        else {
            return;
        };

        if pooled.transport.is_connected() {
            pooled.was_connected = true;
        }
        match err {
            Some(e) => {
                pooled.health_score *= self.config.error_decay;
                pooled.last_error = Some(e.to_string());
            }
            None => {
                pooled.health_score = (pooled.health_score + 1.0) / 2.0;
            }
        }
    }

    /// Disconnects and drops every entry idle longer than the configured maximum.
    /// Returns the last disconnect error, if any.
    pub async fn clean_idle_connections(&self, ctx: &Context) -> Result<()> {
        let max_idle = self.config.max_idle();
        let now = Instant::now();

        let idle: Vec<PooledTransport> = {
            let mut entries = self.entries.write().await;
            let mut idle = Vec::new();
            for slot in entries.values_mut() {
                let (expired, active): (Vec<_>, Vec<_>) = std::mem::take(slot)
                    .into_iter()
                    .partition(|p| now.duration_since(p.last_used) > max_idle);
                *slot = active;
                idle.extend(expired);
            }
            idle
        };

        if !idle.is_empty() {
            tracing::debug!(count = idle.len(), "Closing idle pooled transports");
        }
        disconnect_all(ctx, idle).await
    }

    /// Disconnects every entry of every kind and empties the pool.
    pub async fn close(&self, ctx: &Context) -> Result<()> {
        let all: Vec<PooledTransport> = {
            let mut entries = self.entries.write().await;
            entries.drain().flat_map(|(_, slot)| slot).collect()
        };
        disconnect_all(ctx, all).await
    }

    pub async fn stats(&self) -> PoolStats {
        let entries = self.entries.read().await;
        let mut stats = PoolStats {
            total_transports: 0,
            connected: 0,
            disconnected: 0,
            by_type: BTreeMap::new(),
            max_per_type: self.config.max_per_type,
            max_idle: self.config.max_idle(),
        };

        for (kind, slot) in entries.iter() {
            let connected = slot.iter().filter(|p| p.transport.is_connected()).count();
            stats.total_transports += slot.len();
            stats.connected += connected;
            stats.by_type.insert(
                kind.to_string(),
                TypeStats {
                    total: slot.len(),
                    connected,
                    available: self.config.max_per_type.saturating_sub(slot.len()),
                },
            );
        }
        stats.disconnected = stats.total_transports - stats.connected;
        stats
    }

    /// Current score of a pooled transport, `None` if it is not in the pool.
    pub async fn health_score(&self, transport: &Arc<dyn Transport>) -> Option<f64> {
        let entries = self.entries.read().await;
        entries
            .values()
            .flat_map(|slot| slot.iter())
            .find(|p| same_transport(&p.transport, transport))
            .map(|p| p.health_score)
    }

    /// Runs `clean_idle_connections` every sweep interval until `ctx` finishes.
    pub fn spawn_idle_sweeper(self: &Arc<Self>, ctx: Context) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let interval = self.config.sweep_interval();
        tokio::spawn(async move {
            while ctx.sleep(interval).await.is_ok() {
                let sweep = ctx.child_with_timeout(interval);
                if let Err(e) = pool.clean_idle_connections(&sweep).await {
                    tracing::warn!("Idle sweep reported: {}", e);
                }
            }
            tracing::debug!("Idle sweeper stopped");
        })
    }
}

async fn disconnect_all(ctx: &Context, entries: Vec<PooledTransport>) -> Result<()> {
    let mut last_err = None;
    for pooled in entries {
        tracing::trace!(
            transport = %pooled.transport.transport_type(),
            age_ms = pooled.created_at.elapsed().as_millis() as u64,
            requests = pooled.request_count,
            last_error = pooled.last_error.as_deref().unwrap_or(""),
            "Releasing pooled transport"
        );
        if let Err(e) = pooled.transport.disconnect(ctx).await {
            last_err = Some(e);
        }
    }
    match last_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
