use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use super::{Transport, TransportType};
use crate::context::Context;
use crate::error::{Result, TransportError};
use crate::protocol::Request;

/// One POST per request against `{url}/rpc`.
///
/// There is no persistent channel; "connected" means a client has been built.
/// Dropping the client on disconnect releases its idle keep-alive connections.
pub struct HttpTransport {
    url: String,
    timeout: Duration,
    client: ArcSwapOption<reqwest::Client>,
}

impl HttpTransport {
    pub fn new(url: String, timeout: Duration) -> Self {
        Self {
            url,
            timeout,
            client: ArcSwapOption::empty(),
        }
    }

    fn rpc_url(&self) -> String {
        format!("{}/rpc", self.url)
    }

    async fn probe_health(&self, ctx: &Context, client: &reqwest::Client) {
        let url = format!("{}/health", self.url);
        match ctx.run(client.get(&url).send()).await {
            Ok(Ok(resp)) if resp.status().is_success() => {
                tracing::debug!("Health probe for {} succeeded", self.url);
            }
            Ok(Ok(resp)) => {
                tracing::debug!("Health probe for {} returned {}", self.url, resp.status());
            }
            Ok(Err(e)) => tracing::debug!("Health probe for {} failed: {}", self.url, e),
            Err(e) => tracing::debug!("Health probe for {} abandoned: {}", self.url, e),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self, ctx: &Context) -> Result<()> {
        if self.client.load().is_some() {
            return Ok(());
        }

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        self.probe_health(ctx, &client).await;
        self.client.store(Some(Arc::new(client)));
        tracing::info!("HTTP transport ready for {}", self.url);
        Ok(())
    }

    async fn disconnect(&self, _ctx: &Context) -> Result<()> {
        if self.client.swap(None).is_some() {
            tracing::debug!("HTTP transport for {} released", self.url);
        }
        Ok(())
    }

    async fn send_request(&self, ctx: &Context, request: &Request) -> Result<Bytes> {
        let client = self
            .client
            .load_full()
            .ok_or(TransportError::NotConnected)?;

        let body = serde_json::to_vec(request)?;
        let exchange = async {
            let response = client
                .post(self.rpc_url())
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))?;

            let status = response.status();
            let bytes = response
                .bytes()
                .await
                .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;

            if !status.is_success() {
                return Err(TransportError::Http {
                    status: status.as_u16(),
                    body: String::from_utf8_lossy(&bytes).into_owned(),
                }
                .into());
            }
            Ok(bytes)
        };

        ctx.run(exchange).await?
    }

    fn is_connected(&self) -> bool {
        self.client.load().is_some()
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Http
    }
}
