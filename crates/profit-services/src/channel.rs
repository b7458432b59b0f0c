//! Channel — framed, bidirectional message exchange with one worker agent.
//!
//! Lifecycle: `connect` opens a link, writes the start message and waits
//! for `READY`. After that a writer task drains the outbound queue, a
//! reader task decodes replies and routes them through the dispatch table,
//! and an optional keep-alive task ticks `KEEP_ALIVE` frames. `close`
//! queues the close sentinel; `waitclose` waits for the peer to answer
//! with its own sentinel and forces the link down on timeout.

use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::timeout;

use profit_core::cleanup::{CleanupRequest, CleanupResponse};
use profit_core::config::TransportConfig;
use profit_core::queue::{QueueRequest, QueueResponse};
use profit_core::run::{RunRequest, RunResponse};
use profit_core::transfer::{TransferRequest, TransferResponse};
use profit_core::wire::{self, CLOSE_FRAME, CONNECT_TIMEOUT_SECS, KEEP_ALIVE_SECS};
use profit_core::{ErrorCode, Inbound, MessageSet, Routed, StartMessage, StartReply, WireError};
use tokio::process::Child;

use crate::dispatch::{Lease, Routes, Subscription};
use crate::event::Event;
use crate::transport::{BoxReader, BoxWriter, Endpoint, Link};

// ── Protocols ─────────────────────────────────────────────────────────────────

/// Binds a request set to the reply set that comes back on the same channel.
pub trait Protocol: Send + Sync + 'static {
    type Request: MessageSet + Routed + Sync;
    type Response: MessageSet + Routed + fmt::Debug;
    const NAME: &'static str;
}

pub struct TransferProtocol;
pub struct CleanupProtocol;
pub struct RunProtocol;
pub struct QueueProtocol;

impl Protocol for TransferProtocol {
    type Request = TransferRequest;
    type Response = TransferResponse;
    const NAME: &'static str = "transfer";
}

impl Protocol for CleanupProtocol {
    type Request = CleanupRequest;
    type Response = CleanupResponse;
    const NAME: &'static str = "cleanup";
}

impl Protocol for RunProtocol {
    type Request = RunRequest;
    type Response = RunResponse;
    const NAME: &'static str = "run";
}

impl Protocol for QueueProtocol {
    type Request = QueueRequest;
    type Response = QueueResponse;
    const NAME: &'static str = "queue";
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to launch worker: {0}")]
    Launch(#[source] std::io::Error),
    #[error("connection timeout: no READY within {0:?}")]
    ConnectTimeout(Duration),
    #[error("channel start rejected: {reason}")]
    Rejected {
        reason: String,
        code: Option<ErrorCode>,
    },
    #[error("channel closed")]
    Closed,
    #[error("channel i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("transaction {0} already has a pending handler")]
    DuplicateRoute(String),
}

// ── Options ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub connect_timeout: Duration,
    /// `None` disables keep-alive.
    pub keep_alive: Option<Duration>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            keep_alive: Some(Duration::from_secs(KEEP_ALIVE_SECS)),
        }
    }
}

impl From<&TransportConfig> for ChannelOptions {
    fn from(config: &TransportConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            keep_alive: config.keep_alive(),
        }
    }
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// Transactions remembered per channel before pruning finished ones.
const SENT_PRUNE_AT: usize = 256;

enum Outbound {
    Frame(Vec<u8>),
    Close,
}

/// What goes down with one link: its hold on the route table and the
/// transactions its requests opened.
struct LinkState<M> {
    lease: Lease<M>,
    /// `None` once the link is down.
    sent: Mutex<Option<HashSet<String>>>,
    closed: Event,
}

impl<M> LinkState<M> {
    /// Remember `key` as carried by this link. `false` once the link is down.
    fn track(&self, key: &str) -> bool {
        let Ok(mut guard) = self.sent.lock() else { return false };
        let Some(sent) = guard.as_mut() else { return false };
        if sent.len() >= SENT_PRUNE_AT {
            let routes = self.lease.routes();
            sent.retain(|k| routes.contains(k));
        }
        if !sent.contains(key) {
            sent.insert(key.to_string());
        }
        true
    }

    /// Release the table. When other channels still hold it, end only the
    /// transactions this link carried; their replies can no longer arrive.
    fn down(&self, channel_id: &str) {
        let sent = self
            .sent
            .lock()
            .ok()
            .and_then(|mut s| s.take())
            .unwrap_or_default();
        if !self.lease.release() {
            let routes = self.lease.routes();
            let stranded: Vec<&String> = sent.iter().filter(|k| routes.contains(k)).collect();
            if !stranded.is_empty() {
                tracing::warn!(channel_id, transactions = stranded.len(), "failing transactions of a lost pool member");
            }
            for key in stranded {
                routes.fail(key);
            }
        }
        self.closed.set();
    }
}

pub struct Channel<P: Protocol> {
    channel_id: String,
    remote_path: Option<String>,
    backend: Option<String>,
    outbound: mpsc::UnboundedSender<Outbound>,
    routes: Routes<P::Response>,
    state: Arc<LinkState<P::Response>>,
    closed: Event,
    closing: AtomicBool,
    child: Mutex<Option<Child>>,
    tasks: Vec<AbortHandle>,
    _protocol: PhantomData<P>,
}

impl<P: Protocol> Channel<P> {
    /// Open a link to `endpoint` and perform the start handshake.
    pub async fn connect(
        endpoint: &Endpoint,
        start: StartMessage,
        options: &ChannelOptions,
    ) -> Result<Self, ChannelError> {
        Self::connect_with_routes(endpoint, start, options, Routes::new()).await
    }

    /// As [`connect`](Self::connect), routing replies through a shared table.
    /// The table closes once every channel holding it has gone down.
    pub async fn connect_with_routes(
        endpoint: &Endpoint,
        start: StartMessage,
        options: &ChannelOptions,
        routes: Routes<P::Response>,
    ) -> Result<Self, ChannelError> {
        let channel_id = start.channel_id().to_string();
        let Link {
            reader,
            mut writer,
            child,
        } = endpoint.open().map_err(ChannelError::Launch)?;

        writer.write_all(&wire::encode(&start)?).await?;
        writer.flush().await?;

        let mut lines = BufReader::new(reader).lines();
        let first = match timeout(options.connect_timeout, lines.next_line()).await {
            Err(_) => return Err(ChannelError::ConnectTimeout(options.connect_timeout)),
            Ok(Err(e)) => return Err(ChannelError::Io(e)),
            Ok(Ok(None)) => return Err(ChannelError::Closed),
            Ok(Ok(Some(line))) => line,
        };
        let (remote_path, backend) = match wire::decode_start::<StartReply>(&first)? {
            StartReply::Ready {
                remote_path,
                backend,
                ..
            } => (remote_path, backend),
            StartReply::Error { reason, error_code } => {
                tracing::warn!(channel_id, reason, "worker rejected channel start");
                return Err(ChannelError::Rejected {
                    reason,
                    code: error_code,
                });
            }
        };
        tracing::debug!(channel_id, protocol = P::NAME, ?remote_path, "channel ready");

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let closed = Event::new();
        let state = Arc::new(LinkState {
            lease: routes.lease(),
            sent: Mutex::new(Some(HashSet::new())),
            closed: closed.clone(),
        });
        let mut tasks = Vec::new();

        let writer_task = tokio::spawn(write_loop(writer, outbound_rx, channel_id.clone()));
        let reader_task = tokio::spawn(read_loop::<P>(
            lines,
            routes.clone(),
            state.clone(),
            channel_id.clone(),
        ));
        tasks.push(writer_task.abort_handle());
        tasks.push(reader_task.abort_handle());

        if let Some(period) = options.keep_alive {
            let tx = outbound.clone();
            let closed = closed.clone();
            let keep_alive = tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = closed.wait() => break,
                        _ = interval.tick() => {
                            if tx.send(Outbound::Frame(wire::keep_alive_frame())).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
            tasks.push(keep_alive.abort_handle());
        }

        Ok(Self {
            channel_id,
            remote_path,
            backend,
            outbound,
            routes,
            state,
            closed,
            closing: AtomicBool::new(false),
            child: Mutex::new(child),
            tasks,
            _protocol: PhantomData,
        })
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Root resolved by the worker (transfer and cleanup channels).
    pub fn remote_path(&self) -> Option<&str> {
        self.remote_path.as_deref()
    }

    /// Scheduler resolved by the worker (queueing channels).
    pub fn backend(&self) -> Option<&str> {
        self.backend.as_deref()
    }

    pub fn routes(&self) -> &Routes<P::Response> {
        &self.routes
    }

    /// Set once the peer has closed or the link has failed.
    pub fn closed(&self) -> &Event {
        &self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_set()
    }

    /// Neither closing nor down.
    pub fn is_open(&self) -> bool {
        !self.closing.load(Ordering::SeqCst) && !self.closed.is_set()
    }

    /// Queue one message. Sends from one caller keep their order.
    pub fn send(&self, msg: &P::Request) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        let frame = wire::encode(msg)?;
        if let Some(key) = msg.route() {
            if !self.state.track(key) {
                return Err(ChannelError::Closed);
            }
        }
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| ChannelError::Closed)
    }

    /// Register `key` and send `msg`; the reply arrives on the subscription.
    pub fn request(
        &self,
        key: impl Into<String>,
        msg: &P::Request,
    ) -> Result<Subscription<P::Response>, ChannelError> {
        let sub = self.routes.register(key)?;
        self.send(msg)?;
        Ok(sub)
    }

    /// Queue the close sentinel. Calling this again is a no-op.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(channel_id = %self.channel_id, "closing channel");
        let _ = self.outbound.send(Outbound::Close);
    }

    /// Wait for the peer to acknowledge the close. On timeout the link is
    /// torn down forcefully and `false` is returned.
    pub async fn waitclose(&self, limit: Duration) -> bool {
        if self.closed.wait_timeout(limit).await {
            return true;
        }
        tracing::warn!(channel_id = %self.channel_id, ?limit, "close not acknowledged, forcing");
        self.force_close();
        false
    }

    fn force_close(&self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Ok(mut child) = self.child.lock() {
            if let Some(child) = child.as_mut() {
                let _ = child.start_kill();
            }
        }
        self.state.down(&self.channel_id);
    }
}

impl<P: Protocol> Drop for Channel<P> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn write_loop(
    mut writer: BoxWriter,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    channel_id: String,
) {
    while let Some(out) = rx.recv().await {
        let (frame, last) = match out {
            Outbound::Frame(frame) => (frame, false),
            Outbound::Close => (CLOSE_FRAME.to_vec(), true),
        };
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            tracing::warn!(channel_id, error = %e, "channel write failed");
            break;
        }
        if last {
            let _ = writer.shutdown().await;
            break;
        }
    }
}

async fn read_loop<P: Protocol>(
    mut lines: Lines<BufReader<BoxReader>>,
    routes: Routes<P::Response>,
    state: Arc<LinkState<P::Response>>,
    channel_id: String,
) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match wire::decode::<P::Response>(&line) {
                Ok(Inbound::Message(msg)) => {
                    if let Err(msg) = routes.dispatch(msg) {
                        tracing::debug!(channel_id, ?msg, "dropping unrouted message");
                    }
                }
                Ok(Inbound::KeepAlive) => tracing::trace!(channel_id, "keep-alive echoed"),
                Ok(Inbound::Close) => {
                    tracing::debug!(channel_id, "peer closed channel");
                    break;
                }
                Err(e) => tracing::warn!(channel_id, error = %e, "ignoring malformed message"),
            },
            Ok(None) => {
                tracing::debug!(channel_id, "channel reached end of stream");
                break;
            }
            Err(e) => {
                tracing::warn!(channel_id, error = %e, "channel read failed");
                break;
            }
        }
    }
    state.down(&channel_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use profit_core::config::AgentConfig;
    use profit_core::transfer::EntryId;

    fn scratch(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "profit-channel-{name}-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn handshake_reports_resolved_root() {
        let root = scratch("ready");
        let start = StartMessage::StartDownloadChannel {
            channel_id: "download".into(),
            remote_path: Some(root.display().to_string()),
        };
        let endpoint = Endpoint::local(AgentConfig::default());
        let channel: Channel<TransferProtocol> =
            Channel::connect(&endpoint, start, &ChannelOptions::default()).await.unwrap();
        assert_eq!(channel.channel_id(), "download");
        assert_eq!(channel.remote_path(), Some(root.display().to_string().as_str()));

        channel.close();
        channel.close();
        assert!(channel.waitclose(Duration::from_secs(5)).await);
        assert!(matches!(
            channel.send(&TransferRequest::List {
                id: EntryId::new("t", "."),
                remote_path: ".".into()
            }),
            Err(ChannelError::Closed)
        ));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn lost_link_fails_only_its_own_transactions() {
        let routes: Routes<TransferResponse> = Routes::new();
        let _healthy = routes.lease();
        let link = LinkState {
            lease: routes.lease(),
            sent: Mutex::new(Some(HashSet::new())),
            closed: Event::new(),
        };
        let mut carried = routes.register("carried").unwrap();
        let mut elsewhere = routes.register("elsewhere").unwrap();
        assert!(link.track("carried"));

        link.down("upload_1");
        assert!(link.closed.is_set());
        assert!(!link.track("late"));
        assert!(!routes.is_closed());
        assert!(carried.recv().await.is_none());

        let reply = TransferResponse::Mkdir {
            id: EntryId::new("elsewhere", "d"),
            remote_path: "d".into(),
        };
        routes.dispatch(reply.clone()).unwrap();
        assert_eq!(elsewhere.recv().await, Some(reply));
    }

    #[tokio::test]
    async fn rejected_start_carries_reason() {
        let missing = std::env::temp_dir().join(format!("profit-missing-{}/a/b", uuid::Uuid::new_v4()));
        let start = StartMessage::StartDownloadChannel {
            channel_id: "download".into(),
            remote_path: Some(missing.display().to_string()),
        };
        let endpoint = Endpoint::local(AgentConfig::default());
        let err = Channel::<TransferProtocol>::connect(&endpoint, start, &ChannelOptions::default())
            .await
            .err()
            .expect("start should be rejected");
        match err {
            ChannelError::Rejected { code, .. } => {
                assert!(code.unwrap().is(profit_core::wire::codes::REMOTE_DOES_NOT_EXIST))
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn silent_worker_times_out() {
        // `cat` echoes the start message back, which is not a valid reply,
        // so use `sleep` to get a worker that never answers.
        let endpoint = Endpoint::Process(crate::transport::ProcessSpec {
            program: "sleep".into(),
            args: vec!["5".into()],
        });
        let start = StartMessage::StartCleanupChannel {
            channel_id: "cleanup".into(),
            remote_path: "/tmp".into(),
        };
        let options = ChannelOptions {
            connect_timeout: Duration::from_millis(100),
            keep_alive: None,
        };
        let err = Channel::<CleanupProtocol>::connect(&endpoint, start, &options)
            .await
            .err()
            .expect("should time out");
        assert!(matches!(err, ChannelError::ConnectTimeout(_)));
    }
}
