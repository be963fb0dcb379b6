//! Inbound request dispatch.
//!
//! Gateway methods are answered from the registry. Everything else goes to
//! one upstream chosen by, in order: the `_server` routing hint, the
//! capability implied by the method prefix, or the first registered server.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::context::Context;
use crate::protocol::{methods, JsonRpcError, Request, Response, JSONRPC_VERSION};
use crate::server::{ManagedServer, ServerManager};

#[derive(Debug, Default, Deserialize)]
struct NameParams {
    #[serde(default)]
    name: Option<String>,
}

pub struct Router {
    manager: Arc<ServerManager>,
}

impl Router {
    pub fn new(manager: Arc<ServerManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ServerManager> {
        &self.manager
    }

    /// Parses one inbound line and routes it.
    ///
    /// Malformed JSON yields a parse-error envelope. Valid JSON that is not a
    /// request yields an invalid-request envelope carrying whatever `id` it had.
    /// Notifications (no `id`) are not answered and return `None`.
    pub async fn handle_line(&self, ctx: &Context, line: &str) -> Option<Response> {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!("Rejecting malformed request: {}", e);
                return Some(Response::failure(None, JsonRpcError::parse_error("Parse error")));
            }
        };
        let id = value.get("id").cloned();
        let request: Request = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!("Rejecting invalid request: {}", e);
                return Some(Response::failure(
                    id,
                    JsonRpcError::invalid_request("Invalid request"),
                ));
            }
        };

        if request.id.is_none() {
            tracing::debug!(method = %request.method, "Ignoring notification");
            return None;
        }
        Some(self.route(ctx, request).await)
    }

    pub async fn route(&self, ctx: &Context, request: Request) -> Response {
        let id = request.id.clone();

        if request.jsonrpc != JSONRPC_VERSION {
            return Response::failure(id, JsonRpcError::invalid_request("Invalid JSON-RPC version"));
        }

        let result = match request.method.as_str() {
            methods::GATEWAY_LIST_SERVERS => Ok(self.list_servers()),
            methods::GATEWAY_GET_SERVER => self.get_server(&request),
            methods::GATEWAY_SERVER_STATUS => self.server_status(&request),
            methods::GATEWAY_CAPABILITIES => self.capabilities(&request),
            _ => return self.forward(ctx, request).await,
        };

        match result {
            Ok(value) => Response::success(id, value),
            Err(error) => Response::failure(id, error),
        }
    }

    /// The upstream a forwarded request would go to right now.
    pub fn select_target(&self, request: &Request) -> Option<Arc<ManagedServer>> {
        if let Some(hint) = request.routing_hint() {
            match self.manager.get_server(hint) {
                Ok(server) => return Some(server),
                Err(_) => tracing::debug!("Routing hint names unknown server {}", hint),
            }
        }

        if let Some(capability) = capability_for(&request.method) {
            if let Some(server) = prefer_ready(self.manager.list_servers_by_capability(capability)) {
                return Some(server);
            }
        }

        prefer_ready(self.manager.list_servers())
    }

    async fn forward(&self, ctx: &Context, request: Request) -> Response {
        let id = request.id.clone();
        let Some(server) = self.select_target(&request) else {
            return Response::failure(id, JsonRpcError::server("No servers available"));
        };

        tracing::debug!(
            server = %server.name(),
            method = %request.method,
            "Routing request {:?}",
            id
        );

        let forwarded = request.without_routing_hint();
        let ctx = ctx.child_with_timeout(server.config().request_timeout());
        let raw = match server.send_request(&ctx, &forwarded).await {
            Ok(raw) => raw,
            Err(e) => return Response::failure(id, JsonRpcError::internal(e.to_string())),
        };

        match serde_json::from_slice::<Response>(&raw) {
            Ok(mut response) => {
                response.id = id;
                response
            }
            Err(e) => {
                tracing::warn!(server = %server.name(), "Undecodable upstream reply: {}", e);
                Response::failure(
                    id,
                    JsonRpcError::parse_error("Failed to parse upstream response"),
                )
            }
        }
    }

    fn list_servers(&self) -> Value {
        Value::Array(self.manager.list_servers().iter().map(|s| summary(s)).collect())
    }

    fn get_server(&self, request: &Request) -> Result<Value, JsonRpcError> {
        let server = self.named_server(request)?;
        let mut detail = summary(&server);
        detail["metadata"] = Value::Object(server.metadata().clone());
        Ok(detail)
    }

    fn server_status(&self, request: &Request) -> Result<Value, JsonRpcError> {
        let server = self.named_server(request)?;
        Ok(json!({
            "name": server.name(),
            "connected": server.is_connected(),
            "initialized": server.is_initialized(),
            "last_used": server.last_used(),
        }))
    }

    fn capabilities(&self, request: &Request) -> Result<Value, JsonRpcError> {
        let params = name_params(request)?;
        if let Some(name) = params.name.filter(|n| !n.is_empty()) {
            let server = self.lookup(&name)?;
            return Ok(json!({
                "name": server.name(),
                "capabilities": server.capabilities(),
            }));
        }

        let all: Map<String, Value> = self
            .manager
            .list_servers()
            .iter()
            .map(|s| (s.name().to_string(), json!(s.capabilities())))
            .collect();
        Ok(Value::Object(all))
    }

    fn named_server(&self, request: &Request) -> Result<Arc<ManagedServer>, JsonRpcError> {
        let name = name_params(request)?.name.unwrap_or_default();
        self.lookup(&name)
    }

    fn lookup(&self, name: &str) -> Result<Arc<ManagedServer>, JsonRpcError> {
        self.manager
            .get_server(name)
            .map_err(|_| JsonRpcError::server("Server not found").with_data(json!({ "name": name })))
    }
}

fn name_params(request: &Request) -> Result<NameParams, JsonRpcError> {
    match &request.params {
        None | Some(Value::Null) => Ok(NameParams::default()),
        Some(params @ Value::Object(_)) => serde_json::from_value(params.clone())
            .map_err(|e| JsonRpcError::invalid_params(format!("Invalid parameters: {e}"))),
        Some(_) => Err(JsonRpcError::invalid_params(
            "Invalid parameters: expected an object",
        )),
    }
}

/// Capability implied by a method's prefix.
pub fn capability_for(method: &str) -> Option<&'static str> {
    if method.starts_with("tools/") {
        Some("tools")
    } else if method.starts_with("resources/") {
        Some("resources")
    } else if method.starts_with("prompts/") {
        Some("prompts")
    } else {
        None
    }
}

fn prefer_ready(candidates: Vec<Arc<ManagedServer>>) -> Option<Arc<ManagedServer>> {
    candidates
        .iter()
        .find(|s| s.is_ready())
        .cloned()
        .or_else(|| candidates.into_iter().next())
}

fn summary(server: &ManagedServer) -> Value {
    json!({
        "name": server.name(),
        "connected": server.is_connected(),
        "initialized": server.is_initialized(),
        "transport": server.transport_type().as_str(),
        "capabilities": server.capabilities(),
    })
}
