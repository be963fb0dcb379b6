//! Plumbing shared by the streaming transports (stdio, websocket, unix).
//!
//! Each live connection owns a background reader that pushes complete frames
//! into a bounded queue, and a [`ReplyQueue`] that pairs one written request
//! with the next frame that answers it.

use bytes::Bytes;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::{Result, TransportError};
use crate::protocol::{FramePeek, Request};

pub(crate) const REPLY_QUEUE_DEPTH: usize = 100;

/// A background task with an explicit stop signal, joined on shutdown.
pub(crate) struct ReaderTask {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl ReaderTask {
    pub(crate) fn spawn<F, Fut>(body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stop = CancellationToken::new();
        let handle = tokio::spawn(body(stop.clone()));
        Self { stop, handle }
    }

    /// Signals the task and waits for it to exit; aborts it if `ctx` runs out first.
    pub(crate) async fn shutdown(mut self, ctx: &Context) {
        self.stop.cancel();
        if ctx.run(&mut self.handle).await.is_err() {
            tracing::debug!("Reader task did not stop before deadline, aborting");
            self.handle.abort();
        }
    }
}

pub(crate) fn reply_channel() -> (mpsc::Sender<Bytes>, ReplyQueue) {
    let (tx, rx) = mpsc::channel(REPLY_QUEUE_DEPTH);
    (tx, ReplyQueue { rx: Mutex::new(rx) })
}

/// Receiving side of a connection's frame queue.
///
/// Holding the queue lock for the whole write-then-read makes each connection
/// carry exactly one outstanding request.
pub(crate) struct ReplyQueue {
    rx: Mutex<mpsc::Receiver<Bytes>>,
}

impl ReplyQueue {
    pub(crate) async fn exchange<Fut>(
        &self,
        ctx: &Context,
        request: &Request,
        write: Fut,
    ) -> Result<Bytes>
    where
        Fut: Future<Output = Result<()>>,
    {
        let mut rx = ctx.run(self.rx.lock()).await?;

        // Replies to requests whose callers already gave up.
        while let Ok(stale) = rx.try_recv() {
            tracing::debug!(bytes = stale.len(), "Discarding stale upstream frame");
        }

        write.await?;

        loop {
            match ctx.run(rx.recv()).await? {
                Some(frame) if is_reply_to(&frame, request.id.as_ref()) => return Ok(frame),
                Some(frame) => {
                    tracing::debug!(
                        method = %request.method,
                        frame = %String::from_utf8_lossy(&frame),
                        "Skipping upstream frame that does not answer the outstanding request"
                    );
                }
                None => return Err(TransportError::Closed.into()),
            }
        }
    }
}

/// Upstream-initiated messages carry `method`; replies to other ids are stale.
/// Unparseable frames are accepted so the caller sees the decode failure.
pub(crate) fn is_reply_to(frame: &[u8], id: Option<&Value>) -> bool {
    match serde_json::from_slice::<FramePeek>(frame) {
        Ok(peek) if peek.method.is_some() => false,
        Ok(peek) => match (id, peek.id.as_ref()) {
            (Some(want), Some(got)) => want == got,
            _ => true,
        },
        Err(_) => true,
    }
}

/// Writes one request as a single newline-terminated JSON line.
pub(crate) async fn write_line<W>(writer: &Mutex<W>, request: &Request) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');

    let mut writer = writer.lock().await;
    writer
        .write_all(&line)
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
    Ok(())
}

/// Spawns a reader that turns newline-delimited output into frames.
///
/// Any read error or EOF clears `connected`, so the owner observes the dead
/// connection on its next `is_connected`/`send_request`.
pub(crate) fn spawn_line_reader<R>(
    reader: R,
    frames: mpsc::Sender<Bytes>,
    connected: Arc<AtomicBool>,
    label: String,
) -> ReaderTask
where
    R: AsyncRead + Unpin + Send + 'static,
{
    ReaderTask::spawn(move |stop| async move {
        let mut lines = LinesStream::new(BufReader::new(reader).lines());
        loop {
            let next = tokio::select! {
                _ = stop.cancelled() => break,
                next = lines.next() => next,
            };

            match next {
                Some(Ok(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let frame = Bytes::copy_from_slice(line.as_bytes());
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        sent = frames.send(frame) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(upstream = %label, "Read error, marking disconnected: {}", e);
                    connected.store(false, Ordering::SeqCst);
                    break;
                }
                None => {
                    tracing::info!(upstream = %label, "Upstream closed its output");
                    connected.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_reply_matching_rules() {
        let id = json!(5);
        assert!(is_reply_to(br#"{"jsonrpc":"2.0","id":5,"result":{}}"#, Some(&id)));
        assert!(!is_reply_to(br#"{"jsonrpc":"2.0","id":4,"result":{}}"#, Some(&id)));
        assert!(!is_reply_to(
            br#"{"jsonrpc":"2.0","method":"notifications/progress"}"#,
            Some(&id)
        ));
        // replies without an id are accepted (error envelopes for unparseable input)
        assert!(is_reply_to(br#"{"jsonrpc":"2.0","error":{"code":-32700,"message":"x"}}"#, Some(&id)));
        assert!(is_reply_to(b"not json", Some(&id)));
    }

    #[tokio::test]
    async fn test_line_reader_frames_and_flags_eof() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (tx, queue) = reply_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let task = spawn_line_reader(client, tx, connected.clone(), "test".into());

        let ctx = Context::with_timeout(Duration::from_secs(2));
        let request = Request::new(1, "ping", None);
        let reply = queue
            .exchange(&ctx, &request, async {
                server
                    .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"noise\"}\n\n{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":true}\n")
                    .await
                    .map_err(|e| TransportError::SendFailed(e.to_string()))?;
                Ok::<(), crate::error::GatewayError>(())
            })
            .await
            .unwrap();
        assert_eq!(&reply[..], br#"{"jsonrpc":"2.0","id":1,"result":true}"#);

        drop(server);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!connected.load(Ordering::SeqCst));
        task.shutdown(&ctx).await;
    }

    #[tokio::test]
    async fn test_exchange_honours_deadline() {
        let (_tx, queue) = reply_channel();
        let ctx = Context::with_timeout(Duration::from_millis(30));
        let err = queue
            .exchange(&ctx, &Request::new(1, "ping", None), async {
                Ok::<(), crate::error::GatewayError>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_exchange_drops_stale_frames_before_writing() {
        let (tx, queue) = reply_channel();
        tx.send(Bytes::from_static(br#"{"jsonrpc":"2.0","result":"old"}"#))
            .await
            .unwrap();

        let ctx = Context::with_timeout(Duration::from_secs(1));
        let sender = tx.clone();
        let reply = queue
            .exchange(&ctx, &Request::new(2, "ping", None), async move {
                sender
                    .send(Bytes::from_static(br#"{"jsonrpc":"2.0","id":2,"result":"new"}"#))
                    .await
                    .map_err(|_| TransportError::Closed)?;
                Ok::<(), crate::error::GatewayError>(())
            })
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&reply).contains("new"));
    }
}
