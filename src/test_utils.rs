//! In-memory upstreams for unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use mockall::mock;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::context::Context;
use crate::error::{GatewayError, Result, TransportError};
use crate::protocol::{methods, Request, Response};
use crate::transport::{Transport, TransportType};

mock! {
    pub Upstream {}

    #[async_trait]
    impl Transport for Upstream {
        async fn connect(&self, ctx: &Context) -> Result<()>;
        async fn disconnect(&self, ctx: &Context) -> Result<()>;
        async fn send_request(&self, ctx: &Context, request: &Request) -> Result<Bytes>;
        fn is_connected(&self) -> bool;
        fn transport_type(&self) -> TransportType;
    }
}

enum Handshake {
    Capabilities(Vec<String>),
    Error(i64, String),
    Silent,
}

/// A scripted upstream that answers `initialize` and replies to everything else
/// with `{"server": <label>, "method": <method>}` unless a reply is queued.
pub struct MockTransport {
    label: String,
    connected: AtomicBool,
    failing_connects: AtomicU32,
    timing_out_connects: AtomicU32,
    connect_calls: AtomicU32,
    disconnect_calls: AtomicU32,
    latency: Duration,
    handshake: Mutex<Handshake>,
    queued: Mutex<VecDeque<Result<Bytes>>>,
    requests: Mutex<Vec<Request>>,
}

impl MockTransport {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            connected: AtomicBool::new(false),
            failing_connects: AtomicU32::new(0),
            timing_out_connects: AtomicU32::new(0),
            connect_calls: AtomicU32::new(0),
            disconnect_calls: AtomicU32::new(0),
            latency: Duration::ZERO,
            handshake: Mutex::new(Handshake::Capabilities(Vec::new())),
            queued: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_capabilities(self, caps: &[&str]) -> Self {
        self.set_capabilities(caps);
        self
    }

    pub fn with_handshake_error(self, code: i64, message: &str) -> Self {
        *self.handshake.lock().unwrap() = Handshake::Error(code, message.to_string());
        self
    }

    /// The first `n` connect attempts fail.
    pub fn with_failing_connects(self, n: u32) -> Self {
        self.failing_connects.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// `initialize` is never answered; the request waits until its context ends.
    pub fn with_silent_handshake(self) -> Self {
        *self.handshake.lock().unwrap() = Handshake::Silent;
        self
    }

    /// The first `n` connect attempts run out of time.
    pub fn with_timing_out_connects(self, n: u32) -> Self {
        self.timing_out_connects.store(n, Ordering::SeqCst);
        self
    }

    pub fn set_capabilities(&self, caps: &[&str]) {
        *self.handshake.lock().unwrap() =
            Handshake::Capabilities(caps.iter().map(|c| c.to_string()).collect());
    }

    pub fn set_handshake_ok(&self) {
        *self.handshake.lock().unwrap() = Handshake::Capabilities(Vec::new());
    }

    pub fn queue_reply(&self, reply: Result<Bytes>) {
        self.queued.lock().unwrap().push_back(reply);
    }

    /// Simulates the upstream going away without a disconnect call.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, method: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method)
            .count()
    }

    fn handshake_reply(&self, request: &Request) -> Response {
        match &*self.handshake.lock().unwrap() {
            Handshake::Capabilities(caps) => {
                let caps: serde_json::Map<String, Value> =
                    caps.iter().map(|c| (c.clone(), json!({}))).collect();
                Response::success(
                    request.id.clone(),
                    json!({ "protocolVersion": "2024-11-05", "capabilities": caps }),
                )
            }
            Handshake::Error(code, message) => Response::failure(
                request.id.clone(),
                crate::protocol::JsonRpcError::new(*code, message.clone()),
            ),
            Handshake::Silent => unreachable!("silent handshakes are never answered"),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, ctx: &Context) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            ctx.sleep(self.latency).await?;
        }
        let timing_out = self.timing_out_connects.load(Ordering::SeqCst);
        if timing_out > 0 {
            self.timing_out_connects.store(timing_out - 1, Ordering::SeqCst);
            return Err(GatewayError::DeadlineExceeded);
        }
        let remaining = self.failing_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::ConnectionFailed(format!("{} refused", self.label)).into());
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self, _ctx: &Context) -> Result<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn send_request(&self, ctx: &Context, request: &Request) -> Result<Bytes> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected.into());
        }
        self.requests.lock().unwrap().push(request.clone());
        if !self.latency.is_zero() {
            ctx.sleep(self.latency).await?;
        }

        if request.method == methods::INITIALIZE {
            let silent = matches!(*self.handshake.lock().unwrap(), Handshake::Silent);
            if silent {
                return Err(ctx.done().await);
            }
            return Ok(Bytes::from(serde_json::to_vec(&self.handshake_reply(request))?));
        }
        if let Some(reply) = self.queued.lock().unwrap().pop_front() {
            return reply;
        }
        let response = Response::success(
            request.id.clone(),
            json!({ "server": self.label, "method": request.method }),
        );
        Ok(Bytes::from(serde_json::to_vec(&response)?))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Stdio
    }
}

/// Upstream command that answers every request line with a result naming the
/// method, and advertises `tools` from `initialize`.
pub fn sed_responder() -> (String, Vec<String>) {
    let script = r#"s/^{"jsonrpc":"2.0","id":\([^,}]*\),"method":"\([^"]*\)".*/{"jsonrpc":"2.0","id":\1,"result":{"method":"\2","capabilities":{"tools":{}}}}/"#;
    ("sed".to_string(), vec!["-u".to_string(), script.to_string()])
}

pub fn responder_config(name: &str) -> ServerConfig {
    let (command, args) = sed_responder();
    ServerConfig::stdio(name, command, args)
}
