use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;

use super::stream::{self, ReaderTask, ReplyQueue};
use super::{Transport, TransportType};
use crate::context::Context;
use crate::error::{Result, TransportError};
use crate::protocol::Request;

/// Talks to an upstream server running as a child process over its stdin/stdout.
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
    session: Mutex<Option<StdioSession>>,
    connected: Arc<AtomicBool>,
}

struct StdioSession {
    child: Child,
    stdin: Arc<Mutex<ChildStdin>>,
    replies: Arc<ReplyQueue>,
    stdout_reader: ReaderTask,
    stderr_reader: Option<ReaderTask>,
}

impl StdioTransport {
    pub fn new(command: String, args: Vec<String>) -> Self {
        Self {
            command,
            args,
            env: HashMap::new(),
            working_dir: None,
            session: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    fn spawn_child(&self) -> Result<StdioSession> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            // The child inherits the gateway's environment; configured entries win.
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "Failed to start subprocess '{}': {}",
                self.command, e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::ConnectionFailed("Failed to get stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::ConnectionFailed("Failed to get stdout".into()))?;

        let (frames, replies) = stream::reply_channel();
        self.connected.store(true, Ordering::SeqCst);
        let stdout_reader = stream::spawn_line_reader(
            stdout,
            frames,
            self.connected.clone(),
            self.command.clone(),
        );

        let stderr_reader = child.stderr.take().map(|stderr| {
            let label = self.command.clone();
            ReaderTask::spawn(move |stop| async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => tracing::debug!(target: "upstream", command = %label, "{}", line),
                            _ => break,
                        },
                    }
                }
            })
        });

        Ok(StdioSession {
            child,
            stdin: Arc::new(Mutex::new(stdin)),
            replies: Arc::new(replies),
            stdout_reader,
            stderr_reader,
        })
    }

    async fn release(&self, ctx: &Context, mut session: StdioSession) {
        session.stdout_reader.shutdown(ctx).await;
        if let Some(reader) = session.stderr_reader {
            reader.shutdown(ctx).await;
        }

        if let Err(e) = session.child.start_kill() {
            tracing::debug!("Failed to kill child process {}: {}", self.command, e);
        }
        match ctx.run(session.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!("Subprocess {} exited: {}", self.command, status),
            Ok(Err(e)) => tracing::warn!("Error waiting for subprocess {}: {}", self.command, e),
            Err(e) => tracing::warn!("Subprocess {} not reaped: {}", self.command, e),
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&self, ctx: &Context) -> Result<()> {
        let mut session = ctx.run(self.session.lock()).await?;
        if session.is_some() && self.is_connected() {
            return Ok(());
        }

        // A previous child that died on its own still needs reaping.
        if let Some(stale) = session.take() {
            self.release(ctx, stale).await;
        }

        *session = Some(self.spawn_child()?);
        tracing::info!("Started subprocess: {} {}", self.command, self.args.join(" "));
        Ok(())
    }

    async fn disconnect(&self, ctx: &Context) -> Result<()> {
        let mut session = ctx.run(self.session.lock()).await?;
        let Some(live) = session.take() else {
            return Ok(());
        };
        self.connected.store(false, Ordering::SeqCst);
        self.release(ctx, live).await;
        Ok(())
    }

    async fn send_request(&self, ctx: &Context, request: &Request) -> Result<Bytes> {
        let (stdin, replies) = {
            let session = ctx.run(self.session.lock()).await?;
            match session.as_ref() {
                Some(s) if self.is_connected() => (s.stdin.clone(), s.replies.clone()),
                _ => return Err(TransportError::NotConnected.into()),
            }
        };

        replies
            .exchange(ctx, request, stream::write_line(&stdin, request))
            .await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Stdio
    }
}
