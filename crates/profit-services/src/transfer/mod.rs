//! Directory transfer engine.
//!
//! A transfer copies one directory subtree between the local filesystem and
//! a worker root, over a [`MultiChannel`] pool. Each transfer runs as its own
//! task holding a route for its transaction id, so any number of transfers
//! can share a pool without seeing each other's replies.
//!
//! Progress is reported through a handler: per-entry `mkdir`/`write_file`
//! calls on download, path translation in both directions, and one final
//! [`Finish::finish`] call that decides whether a captured error reaches the
//! caller.

mod download;
mod handler;
mod upload;

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use profit_core::config::TransportConfig;
use profit_core::ErrorCode;

use crate::channel::TransferProtocol;
use crate::event::Event;
use crate::multichannel::MultiChannel;

pub use handler::{
    DirectoryDownloadHandler, DirectoryUploadHandler, DownloadHandler, Finish, FinishAction,
    UploadHandler,
};

pub type TransferPool = MultiChannel<TransferProtocol>;

// ── Errors ────────────────────────────────────────────────────────────────────

/// An entry the transfer stepped over instead of failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub path: String,
    pub reason: String,
    pub code: ErrorCode,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransferError {
    #[error("download cancelled")]
    DownloadCancelled,
    #[error("upload cancelled")]
    UploadCancelled,
    #[error("remote error on {path}: {reason} ({code})")]
    Remote {
        path: String,
        reason: String,
        code: ErrorCode,
    },
    #[error("{} entries skipped", .0.len())]
    Skipped(Vec<SkippedEntry>),
    #[error("local i/o on {path}: {source}")]
    Local {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("transfer channel failed: {0}")]
    Channel(String),
    #[error("destination {0} does not exist")]
    MissingDestination(PathBuf),
}

impl TransferError {
    pub fn local(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Local {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::DownloadCancelled | Self::UploadCancelled)
    }
}

// ── Options ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Attempts per request when the channel refuses a send.
    pub retries: u32,
    pub retry_pause: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_pause: Duration::from_millis(500),
        }
    }
}

impl From<&TransportConfig> for TransferOptions {
    fn from(config: &TransportConfig) -> Self {
        Self {
            retries: config.transfer_retries,
            ..Self::default()
        }
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Outcome {
    captured: Option<TransferError>,
    result: Result<(), TransferError>,
}

struct State {
    transaction_id: String,
    token: CancellationToken,
    finished: Event,
    cancelled: Event,
    outcome: OnceLock<Outcome>,
}

/// Handle to a running transfer.
#[derive(Clone)]
pub struct Transfer {
    state: Arc<State>,
}

impl Transfer {
    fn new() -> Self {
        Self {
            state: Arc::new(State {
                transaction_id: uuid::Uuid::new_v4().to_string(),
                token: CancellationToken::new(),
                finished: Event::new(),
                cancelled: Event::new(),
                outcome: OnceLock::new(),
            }),
        }
    }

    pub fn transaction_id(&self) -> &str {
        &self.state.transaction_id
    }

    pub fn finished(&self) -> &Event {
        &self.state.finished
    }

    pub fn is_finished(&self) -> bool {
        self.state.finished.is_set()
    }

    /// Stop the transfer. The returned event is set once it has wound down.
    pub fn cancel(&self) -> Event {
        self.state.token.cancel();
        if self.state.finished.is_set() {
            self.state.cancelled.set();
        }
        self.state.cancelled.clone()
    }

    /// Error captured by the engine, whether or not the handler suppressed it.
    pub fn error(&self) -> Option<TransferError> {
        self.state.outcome.get().and_then(|o| o.captured.clone())
    }

    /// Wait for the transfer and return what the handler let through.
    pub async fn wait(&self) -> Result<(), TransferError> {
        self.state.finished.wait().await;
        match self.state.outcome.get() {
            Some(outcome) => outcome.result.clone(),
            None => Err(TransferError::Channel("transfer ended without an outcome".into())),
        }
    }

    fn token(&self) -> &CancellationToken {
        &self.state.token
    }

    /// Run the handler's `finish`, publish the outcome and raise the events.
    fn complete<F: Finish + ?Sized>(&self, handler: &mut F, captured: Option<TransferError>) {
        let result = match handler.finish(captured.as_ref()) {
            Err(e) => Err(e),
            Ok(FinishAction::Suppress) => Ok(()),
            Ok(FinishAction::Propagate) => match &captured {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            },
        };
        match &result {
            Ok(()) => tracing::debug!(transaction_id = %self.transaction_id(), "transfer finished"),
            Err(e) => tracing::debug!(transaction_id = %self.transaction_id(), error = %e, "transfer failed"),
        }
        let _ = self.state.outcome.set(Outcome { captured, result });
        self.state.finished.set();
        if self.state.token.is_cancelled() {
            self.state.cancelled.set();
        }
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// Starts uploads and downloads over one pool.
#[derive(Clone)]
pub struct Transfers {
    pool: Arc<TransferPool>,
    options: TransferOptions,
}

impl Transfers {
    pub fn new(pool: Arc<TransferPool>, options: TransferOptions) -> Self {
        Self { pool, options }
    }

    pub fn pool(&self) -> &Arc<TransferPool> {
        &self.pool
    }

    /// Start downloading `remote_path` (relative to the pool root).
    pub fn start_download<H: DownloadHandler>(&self, remote_path: &str, handler: H) -> Transfer {
        download::start(self.pool.clone(), self.options.clone(), remote_path, handler)
    }

    /// Download and wait.
    pub async fn download<H: DownloadHandler>(
        &self,
        remote_path: &str,
        handler: H,
    ) -> Result<(), TransferError> {
        self.start_download(remote_path, handler).wait().await
    }

    /// Start uploading the handler's local root.
    pub fn start_upload<H: UploadHandler>(&self, handler: H) -> Transfer {
        upload::start(self.pool.clone(), self.options.clone(), handler)
    }

    /// `MKDIRS` one remote path outside any transfer.
    pub async fn mkdirs(&self, remote_path: &str) -> Result<bool, TransferError> {
        upload::mkdirs(&self.pool, &self.options, remote_path, 0o755).await
    }

    /// Upload and wait.
    pub async fn upload<H: UploadHandler>(&self, handler: H) -> Result<(), TransferError> {
        self.start_upload(handler).wait().await
    }
}
