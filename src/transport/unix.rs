use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use super::stream::{self, ReaderTask, ReplyQueue};
use super::{Transport, TransportType};
use crate::context::Context;
use crate::error::{Result, TransportError};
use crate::protocol::Request;

/// Newline-delimited JSON over a unix domain socket.
pub struct UnixSocketTransport {
    socket_path: PathBuf,
    session: Mutex<Option<UnixSession>>,
    connected: Arc<AtomicBool>,
}

struct UnixSession {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    replies: Arc<ReplyQueue>,
    reader: ReaderTask,
}

impl UnixSocketTransport {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            session: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Transport for UnixSocketTransport {
    async fn connect(&self, ctx: &Context) -> Result<()> {
        let mut session = ctx.run(self.session.lock()).await?;
        if session.is_some() && self.is_connected() {
            return Ok(());
        }
        if let Some(stale) = session.take() {
            stale.reader.shutdown(ctx).await;
        }

        let socket = ctx
            .run(UnixStream::connect(&self.socket_path))
            .await?
            .map_err(|e| {
                TransportError::ConnectionFailed(format!(
                    "Failed to dial {}: {}",
                    self.socket_path.display(),
                    e
                ))
            })?;

        let (read, write) = socket.into_split();
        let (frames, replies) = stream::reply_channel();
        self.connected.store(true, Ordering::SeqCst);
        let reader = stream::spawn_line_reader(
            read,
            frames,
            self.connected.clone(),
            self.socket_path.display().to_string(),
        );

        *session = Some(UnixSession {
            writer: Arc::new(Mutex::new(write)),
            replies: Arc::new(replies),
            reader,
        });
        tracing::info!("Connected to unix socket {}", self.socket_path.display());
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
        if let Ok(Err(e)) = ctx.run(writer.shutdown()).await {
            tracing::debug!("Shutdown of {} reported: {}", self.socket_path.display(), e);
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

        replies
            .exchange(ctx, request, stream::write_line(&writer, request))
            .await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Unix
    }
}
