use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::stream::{self, ReaderTask, ReplyQueue};
use super::{Transport, TransportType};
use crate::context::Context;
use crate::error::{GatewayError, Result, TransportError};
use crate::protocol::Request;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// How long the reader waits for a frame before pinging the peer.
const READ_REFRESH: Duration = Duration::from_secs(30);

/// A persistent websocket carrying one JSON-RPC message per text frame.
pub struct WebSocketTransport {
    url: String,
    timeout: Duration,
    read_refresh: Duration,
    session: Mutex<Option<WsSession>>,
    connected: Arc<AtomicBool>,
}

struct WsSession {
    writer: Arc<Mutex<WsSink>>,
    replies: Arc<ReplyQueue>,
    reader: ReaderTask,
}

impl WebSocketTransport {
    pub fn new(url: String, timeout: Duration) -> Self {
        Self {
            url,
            timeout,
            read_refresh: READ_REFRESH,
            session: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    #[cfg(test)]
    fn with_read_refresh(mut self, refresh: Duration) -> Self {
        self.read_refresh = refresh;
        self
    }

    fn spawn_reader(
        &self,
        mut read: SplitStream<WsStream>,
        writer: Arc<Mutex<WsSink>>,
        frames: mpsc::Sender<Bytes>,
    ) -> ReaderTask {
        let connected = self.connected.clone();
        let url = self.url.clone();
        let refresh = self.read_refresh;

        ReaderTask::spawn(move |stop| async move {
            loop {
                let next = tokio::select! {
                    _ = stop.cancelled() => break,
                    next = tokio::time::timeout(refresh, read.next()) => next,
                };

                let frame = match next {
                    Err(_) => {
                        // Quiet peer; a ping keeps intermediaries from dropping us.
                        if let Err(e) = writer.lock().await.send(Message::Ping(Vec::new())).await {
                            tracing::warn!(upstream = %url, "Ping failed, marking disconnected: {}", e);
                            connected.store(false, Ordering::SeqCst);
                            break;
                        }
                        continue;
                    }
                    Ok(Some(Ok(Message::Text(text)))) => Bytes::from(text),
                    Ok(Some(Ok(Message::Binary(data)))) => Bytes::from(data),
                    Ok(Some(Ok(Message::Close(frame)))) => {
                        tracing::info!(upstream = %url, "WebSocket closed by peer: {:?}", frame);
                        connected.store(false, Ordering::SeqCst);
                        break;
                    }
                    Ok(Some(Ok(_))) => continue,
                    Ok(Some(Err(e))) => {
                        tracing::warn!(upstream = %url, "WebSocket read error: {}", e);
                        connected.store(false, Ordering::SeqCst);
                        break;
                    }
                    Ok(None) => {
                        connected.store(false, Ordering::SeqCst);
                        break;
                    }
                };

                tokio::select! {
                    _ = stop.cancelled() => break,
                    sent = frames.send(frame) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, ctx: &Context) -> Result<()> {
        let mut session = ctx.run(self.session.lock()).await?;
        if session.is_some() && self.is_connected() {
            return Ok(());
        }
        if let Some(stale) = session.take() {
            stale.reader.shutdown(ctx).await;
        }

        let handshake = ctx.child_with_timeout(self.timeout);
        let (ws, _) = handshake
            .run(tokio_tungstenite::connect_async(self.url.as_str()))
            .await?
            .map_err(|e| {
                TransportError::ConnectionFailed(format!(
                    "WebSocket handshake with {} failed: {}",
                    self.url, e
                ))
            })?;

        let (write, read) = ws.split();
        let writer = Arc::new(Mutex::new(write));
        let (frames, replies) = stream::reply_channel();

        self.connected.store(true, Ordering::SeqCst);
        let reader = self.spawn_reader(read, writer.clone(), frames);

        *session = Some(WsSession {
            writer,
            replies: Arc::new(replies),
            reader,
        });
        tracing::info!("Connected to WebSocket {}", self.url);
        Ok(())
    }

    async fn disconnect(&self, ctx: &Context) -> Result<()> {
        let mut session = ctx.run(self.session.lock()).await?;
        let Some(live) = session.take() else {
            return Ok(());
        };
        self.connected.store(false, Ordering::SeqCst);
        live.reader.shutdown(ctx).await;

        let mut writer = live.writer.lock().await;
        if let Ok(Err(e)) = ctx.run(writer.close()).await {
            tracing::debug!("WebSocket close for {} reported: {}", self.url, e);
        }
        Ok(())
    }

    async fn send_request(&self, ctx: &Context, request: &Request) -> Result<Bytes> {
        let (writer, replies) = {
            let session = ctx.run(self.session.lock()).await?;
            match session.as_ref() {
                Some(s) if self.is_connected() => (s.writer.clone(), s.replies.clone()),
                _ => return Err(TransportError::NotConnected.into()),
            }
        };

        let text = serde_json::to_string(request)?;
        replies
            .exchange(ctx, request, async move {
                writer
                    .lock()
                    .await
                    .send(Message::Text(text))
                    .await
                    .map_err(|e| TransportError::SendFailed(e.to_string()))?;
                Ok::<(), GatewayError>(())
            })
            .await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Response;
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    /// Answers every text request with a result naming its method, preceded by
    /// an unsolicited notification the transport has to skip.
    async fn rpc_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        if !msg.is_text() {
                            continue;
                        }
                        let Ok(text) = msg.into_text() else {
                            continue;
                        };
                        let Ok(request) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        let notice = json!({"jsonrpc": "2.0", "method": "notifications/progress"});
                        let reply = json!({
                            "jsonrpc": "2.0",
                            "id": request["id"],
                            "result": {"method": request["method"]},
                        });
                        if ws.send(Message::Text(notice.to_string())).await.is_err()
                            || ws.send(Message::Text(reply.to_string())).await.is_err()
                        {
                            break;
                        }
                    }
                });
            }
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn test_round_trip_over_rpc_server() {
        let url = rpc_server().await;
        let transport = WebSocketTransport::new(url, Duration::from_secs(5))
            .with_read_refresh(Duration::from_millis(50));
        let ctx = Context::with_timeout(Duration::from_secs(5));

        transport.connect(&ctx).await.unwrap();
        assert!(transport.is_connected());

        // Outlive a few read refreshes so the ping path runs.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(transport.is_connected());

        for (id, method) in [("abc", "resources/list"), ("def", "tools/list")] {
            let request = Request::new(id, method, None);
            let reply = transport.send_request(&ctx, &request).await.unwrap();
            let response: Response = serde_json::from_slice(&reply).unwrap();
            assert_eq!(response.id, request.id);
            assert_eq!(response.result.unwrap()["method"], method);
        }

        transport.disconnect(&ctx).await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_refused_dial_is_connection_error() {
        let transport = WebSocketTransport::new("ws://127.0.0.1:1".into(), Duration::from_secs(2));
        let err = transport
            .connect(&Context::with_timeout(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Transport(TransportError::ConnectionFailed(_))
        ));
        assert!(!transport.is_connected());
    }
}
