//! Worker side — one agent per channel.
//!
//! `serve` reads the start message, builds the matching agent, answers
//! `READY`, then pumps decoded requests into it until the close sentinel or
//! end of stream. The same code serves `profitd serve` over stdio and the
//! in-process loopback used by the local backend.

pub mod backend;
mod cleanup;
mod queue;
mod run;
mod transfer;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::mpsc;

use profit_core::config::AgentConfig;
use profit_core::wire::{self, Code, CLOSE_FRAME};
use profit_core::{ErrorCode, Inbound, MessageSet, StartMessage, StartReply};

pub use backend::QueueBackend;

// ── Outbox ────────────────────────────────────────────────────────────────────

enum Frame {
    Data(Vec<u8>),
    Close,
}

/// Reply sink shared by an agent and the tasks it spawns.
#[derive(Clone)]
pub(crate) struct Outbox {
    tx: mpsc::UnboundedSender<Frame>,
}

#[derive(Serialize)]
struct ErrorFrame<'a> {
    msg: &'static str,
    reason: &'a str,
    error_code: ErrorCode,
}

impl Outbox {
    pub(crate) fn send<M: Serialize>(&self, msg: &M) {
        match wire::encode(msg) {
            Ok(frame) => {
                let _ = self.tx.send(Frame::Data(frame));
            }
            Err(e) => tracing::error!(error = %e, "failed to encode reply"),
        }
    }

    /// `ERROR` with no transaction attached.
    fn error(&self, reason: &str, code: Code) {
        self.send(&ErrorFrame {
            msg: "ERROR",
            reason,
            error_code: code.into(),
        });
    }

    fn raw(&self, frame: Vec<u8>) {
        let _ = self.tx.send(Frame::Data(frame));
    }

    fn close(&self) {
        let _ = self.tx.send(Frame::Close);
    }
}

async fn write_frames<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) -> anyhow::Result<()> {
    while let Some(frame) = rx.recv().await {
        match frame {
            Frame::Data(bytes) => {
                writer.write_all(&bytes).await.context("writing reply")?;
                writer.flush().await.context("flushing reply")?;
            }
            Frame::Close => {
                writer.write_all(CLOSE_FRAME).await.context("writing close")?;
                writer.flush().await?;
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
    Ok(())
}

// ── Agents ────────────────────────────────────────────────────────────────────

/// Handshake refusal.
#[derive(Debug)]
pub(crate) struct Rejection {
    pub reason: String,
    pub code: Code,
}

impl Rejection {
    pub(crate) fn new(code: Code, reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            code,
        }
    }
}

#[async_trait]
pub(crate) trait Agent: Send + 'static {
    type Request: MessageSet;

    fn ready(&self) -> StartReply;

    /// Called once after `READY` has been queued.
    fn started(&mut self, _out: &Outbox) {}

    async fn handle(&mut self, request: Self::Request, out: &Outbox);

    /// Runs after the close sentinel or end of stream, before the close is
    /// acknowledged.
    async fn shutdown(&mut self, _out: &Outbox) {}
}

/// Serve one channel on `reader`/`writer` until it closes.
pub async fn serve<R, W>(reader: R, writer: W, config: AgentConfig) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    let Some(first) = lines.next_line().await.context("reading start message")? else {
        return Ok(());
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_frames(writer, rx));
    let out = Outbox { tx };

    match wire::decode_start::<StartMessage>(&first) {
        Ok(start) => {
            let channel_id = start.channel_id().to_string();
            tracing::debug!(channel_id, "channel start received");
            if let Err(rejection) = dispatch_start(start, &config, &mut lines, &out).await {
                tracing::warn!(channel_id, reason = %rejection.reason, "channel start rejected");
                out.send(&StartReply::Error {
                    reason: rejection.reason,
                    error_code: Some(rejection.code.into()),
                });
                out.close();
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "invalid start message");
            out.send(&StartReply::Error {
                reason: e.to_string(),
                error_code: Some(e.code().into()),
            });
            out.close();
        }
    }

    drop(out);
    writer_task.await.context("reply writer panicked")?
}

async fn dispatch_start<R>(
    start: StartMessage,
    config: &AgentConfig,
    lines: &mut Lines<BufReader<R>>,
    out: &Outbox,
) -> Result<(), Rejection>
where
    R: AsyncRead + Unpin + Send,
{
    match start {
        StartMessage::StartUploadChannel {
            channel_id,
            remote_path,
        } => {
            let agent = transfer::TransferAgent::upload(channel_id, remote_path, config).await?;
            pump(agent, lines, out).await;
        }
        StartMessage::StartDownloadChannel {
            channel_id,
            remote_path,
        } => {
            let agent = transfer::TransferAgent::download(channel_id, remote_path, config).await?;
            pump(agent, lines, out).await;
        }
        StartMessage::StartCleanupChannel {
            channel_id,
            remote_path,
        } => {
            let agent = cleanup::CleanupAgent::start(channel_id, remote_path).await?;
            pump(agent, lines, out).await;
        }
        StartMessage::StartChannel {
            channel_id,
            shell,
            hardkill_timeout,
            max_jobs,
        } => {
            let agent = run::RunAgent::start(channel_id, shell, hardkill_timeout, max_jobs)?;
            pump(agent, lines, out).await;
        }
        StartMessage::StartQueueingChannel {
            channel_id,
            backend,
            poll_interval,
        } => {
            let agent =
                queue::QueueAgent::start(channel_id, backend.as_deref(), poll_interval, config)
                    .await?;
            pump(agent, lines, out).await;
        }
    }
    Ok(())
}

/// Feed requests to `agent` until the channel closes, then acknowledge.
async fn pump<A, R>(mut agent: A, lines: &mut Lines<BufReader<R>>, out: &Outbox)
where
    A: Agent,
    R: AsyncRead + Unpin + Send,
{
    out.send(&agent.ready());
    agent.started(out);

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::debug!("client went away");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "channel read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match wire::decode::<A::Request>(&line) {
            Ok(Inbound::Message(request)) => agent.handle(request, out).await,
            Ok(Inbound::KeepAlive) => out.raw(wire::keep_alive_frame()),
            Ok(Inbound::Close) => {
                tracing::debug!("close sentinel received");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "rejecting request");
                out.error(&e.to_string(), e.code());
            }
        }
    }

    agent.shutdown(out).await;
    out.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn exchange(input: &str) -> String {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_rx, server_tx) = tokio::io::split(server);
        let agent = tokio::spawn(serve(server_rx, server_tx, AgentConfig::default()));
        let (mut rx, mut tx) = tokio::io::split(client);
        tx.write_all(input.as_bytes()).await.unwrap();
        let mut output = String::new();
        rx.read_to_string(&mut output).await.unwrap();
        agent.await.unwrap().unwrap();
        output
    }

    #[tokio::test]
    async fn keep_alive_is_echoed_and_unknown_messages_rejected() {
        let root = std::env::temp_dir().join(format!("profit-agent-{}", std::process::id()));
        std::fs::create_dir_all(&root).unwrap();
        let input = format!(
            "{{\"msg\":\"START_CLEANUP_CHANNEL\",\"channel_id\":\"c\",\"remote_path\":\"{}\"}}\n\
             {{\"msg\":\"KEEP_ALIVE\"}}\n\
             {{\"msg\":\"EXPLODE\"}}\n\
             null\n",
            root.display()
        );
        let output = exchange(&input).await;
        let lines: Vec<&str> = output.lines().collect();
        assert!(lines[0].contains("\"READY\""));
        assert_eq!(lines[1], r#"{"msg":"KEEP_ALIVE"}"#);
        assert!(lines[2].contains("UNKNOWN_MSGTYPE"));
        assert_eq!(lines.last(), Some(&"null"));
        // Closing a cleanup channel removes its root.
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn malformed_start_is_refused() {
        let output = exchange("{\"msg\":\"START_NOTHING\",\"channel_id\":\"x\"}\n").await;
        assert!(output.starts_with(r#"{"msg":"ERROR""#));
        assert!(output.ends_with("null\n"));
    }
}
