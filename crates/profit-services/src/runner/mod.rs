//! Runner — drives batches of jobs through upload, execution and download
//! on one backend.
//!
//! A runner owns every channel it talks over: an upload pool, a download
//! pool, a cleanup channel guarding its worker-side root, and either a run
//! channel or a queueing channel. Batches borrow those; nothing outlives
//! [`Runner::close`], which tears them down in a fixed order:
//!
//! 1. terminate batches
//! 2. close the run or queueing channel
//! 3. close the transfer pools
//! 4. flush and close cleanup, which removes the runner root

mod batch;
mod job;
mod url;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use profit_core::config::ProfitConfig;
use profit_core::StartMessage;

use crate::channel::{ChannelError, ChannelOptions};
use crate::cleanup_client::{CleanupClient, CleanupError};
use crate::event::Event;
use crate::multichannel::MultiChannel;
use crate::queue::{QueueClient, QueueError, QueueSettings};
use crate::retry::retry_backoff;
use crate::run_client::{RunClient, RunError, RunSettings};
use crate::transfer::{TransferError, TransferOptions, TransferPool, Transfers};
use crate::transport::{Endpoint, SshTarget};

pub use batch::{BatchHandle, BatchNameIterator, BatchReport, JobOutcome};
pub use job::JobSpec;
pub use url::{BackendUrl, Scheme, UrlError};

/// Attempts at the first connection to a backend.
const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_PAUSE: Duration = Duration::from_secs(1);

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
pub enum RunnerError {
    #[error("runner closed")]
    RunnerClosed,
    #[error("job killed")]
    JobKilled,
    #[error("job exited with status {}", .0.map_or("<signal>".to_string(), |c| c.to_string()))]
    NonZeroExitStatus(Option<i32>),
    #[error("batch already finished")]
    BatchAlreadyFinished,
    #[error("batch killed")]
    BatchKilled,
    #[error("could not lock batch directory: {0}")]
    BatchDirectoryLock(CleanupError),
    #[error(transparent)]
    Url(#[from] UrlError),
    #[error("backend connection failed: {0}")]
    Connect(String),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Run(RunError),
    #[error(transparent)]
    Queue(QueueError),
    #[error(transparent)]
    Cleanup(#[from] CleanupError),
    #[error("local i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },
}

impl RunnerError {
    pub fn is_killed(&self) -> bool {
        matches!(self, Self::JobKilled | Self::BatchKilled)
    }
}

impl From<RunError> for RunnerError {
    fn from(e: RunError) -> Self {
        match e {
            RunError::Killed => Self::JobKilled,
            RunError::NonZeroExitStatus(code) => Self::NonZeroExitStatus(code),
            other => Self::Run(other),
        }
    }
}

impl From<QueueError> for RunnerError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Killed => Self::JobKilled,
            other => Self::Queue(other),
        }
    }
}

impl From<ChannelError> for RunnerError {
    fn from(e: ChannelError) -> Self {
        Self::Connect(e.to_string())
    }
}

// ── Observers ─────────────────────────────────────────────────────────────────

/// Batch lifecycle notifications.
pub trait RunnerObserver: Send + Sync {
    fn batch_created(&self, _name: &str, _jobs: usize) {}
    fn batch_finished(&self, _report: &BatchReport) {}
}

// ── Runner ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
enum Executor {
    Run(RunClient),
    Queue(QueueClient),
}

impl Executor {
    fn close(&self) {
        match self {
            Self::Run(client) => client.close(),
            Self::Queue(client) => client.close(),
        }
    }

    async fn waitclose(&self, limit: Duration) -> bool {
        match self {
            Self::Run(client) => client.waitclose(limit).await,
            Self::Queue(client) => client.waitclose(limit).await,
        }
    }
}

struct RunnerInner {
    id: String,
    url: BackendUrl,
    /// Worker-side directory the transfer pools are rooted at.
    base: String,
    /// Runner root relative to `base`; empty when the runner owns `base`.
    root_rel: String,
    uploads: Transfers,
    downloads: Transfers,
    cleanup: CleanupClient,
    executor: Executor,
    batch_size: usize,
    close_timeout: Duration,
    names: Mutex<BatchNameIterator>,
    batches: Mutex<Vec<BatchHandle>>,
    observers: Mutex<Vec<Arc<dyn RunnerObserver>>>,
    closing: AtomicBool,
    closed: Event,
}

impl RunnerInner {
    /// `rel` (relative to the runner root) as a transfer-pool path.
    fn transfer_path(&self, rel: &str) -> String {
        join(&self.root_rel, rel)
    }

    /// `rel` as an absolute worker path.
    fn worker_path(&self, rel: &str) -> String {
        join(&self.base, &self.transfer_path(rel))
    }

    fn observers(&self) -> Vec<Arc<dyn RunnerObserver>> {
        self.observers.lock().map(|o| o.clone()).unwrap_or_default()
    }
}

fn join(a: &str, b: &str) -> String {
    match (a.is_empty(), b.is_empty()) {
        (true, _) => b.to_string(),
        (_, true) => a.to_string(),
        _ => format!("{}/{}", a.trim_end_matches('/'), b),
    }
}

/// Closes what a failed [`Runner::connect`] had already opened. Dropping it
/// armed only queues the closes; [`Abandon::close`] also waits for them, so
/// the cleanup agent gets to remove the runner root.
#[derive(Default)]
struct Abandon {
    pools: Vec<Arc<TransferPool>>,
    cleanup: Option<CleanupClient>,
}

impl Abandon {
    fn disarm(&mut self) {
        self.pools.clear();
        self.cleanup = None;
    }

    async fn close(&mut self, limit: Duration) {
        for pool in &self.pools {
            pool.close();
        }
        for pool in &self.pools {
            pool.waitclose(limit).await;
        }
        if let Some(cleanup) = &self.cleanup {
            cleanup.close();
            cleanup.waitclose(limit).await;
        }
        self.disarm();
    }
}

impl Drop for Abandon {
    fn drop(&mut self) {
        for pool in &self.pools {
            pool.close();
        }
        if let Some(cleanup) = &self.cleanup {
            cleanup.close();
        }
    }
}

/// Every channel a runner holds.
struct Opened {
    base: String,
    root_rel: String,
    uploads: Transfers,
    downloads: Transfers,
    cleanup: CleanupClient,
    executor: Executor,
}

/// Open the runner's channels in order, recording each in `opened`. The
/// cleanup channel comes up right after the runner root exists, so a later
/// failure still gets the root removed.
async fn open(
    config: &ProfitConfig,
    url: &BackendUrl,
    endpoint: &Endpoint,
    id: &str,
    opened: &mut Abandon,
) -> Result<Opened, RunnerError> {
    let options = ChannelOptions::from(&config.transport);
    let transfer_options = TransferOptions::from(&config.transport);
    let size = config.runner.transfer_channels.max(1);

    // The first connection is where an unreachable host shows up.
    let upload_start = StartMessage::StartUploadChannel {
        channel_id: format!("upload-{id}"),
        remote_path: url.remote_path.clone(),
    };
    let upload_pool: TransferPool = retry_backoff(CONNECT_PAUSE, CONNECT_PAUSE * 8, CONNECT_ATTEMPTS, || {
        MultiChannel::connect(endpoint, upload_start.clone(), size, &options)
    })
    .await?;
    let uploads = Transfers::new(Arc::new(upload_pool), transfer_options.clone());
    opened.pools.push(uploads.pool().clone());
    let base = uploads
        .pool()
        .remote_path()
        .ok_or_else(|| RunnerError::Connect("upload channel reported no root".into()))?
        .to_string();

    let root_rel = if url.remote_path.is_some() {
        uploads.mkdirs(id).await?;
        id.to_string()
    } else {
        String::new()
    };
    let root = join(&base, &root_rel);

    let cleanup = if config.runner.do_cleanup {
        CleanupClient::connect(endpoint, &root, &options, config.transport.cleanup_timeout())
            .await
            .inspect_err(|e| tracing::warn!(root = %root, error = %e, "cleanup channel failed, runner root left behind"))?
    } else {
        CleanupClient::null()
    };
    opened.cleanup = Some(cleanup.clone());

    let download_pool: TransferPool = MultiChannel::connect(
        endpoint,
        StartMessage::StartDownloadChannel {
            channel_id: format!("download-{id}"),
            remote_path: Some(base.clone()),
        },
        size,
        &options,
    )
    .await?;
    let downloads = Transfers::new(Arc::new(download_pool), transfer_options);
    opened.pools.push(downloads.pool().clone());

    let executor = match &url.scheme {
        Scheme::Queue(backend) => Executor::Queue(
            QueueClient::connect(
                endpoint,
                &QueueSettings::from_config(config, backend.clone()),
                &options,
            )
            .await?,
        ),
        _ => Executor::Run(
            RunClient::connect(
                endpoint,
                &RunSettings {
                    shell: config.agent.shell.clone(),
                    hardkill_timeout: Duration::from_secs(config.agent.hardkill_timeout_secs),
                    max_jobs: config.runner.max_jobs,
                    kill_timeout: config.transport.kill_timeout(),
                },
                &options,
            )
            .await?,
        ),
    };

    Ok(Opened {
        base,
        root_rel,
        uploads,
        downloads,
        cleanup,
        executor,
    })
}

/// Runs batches on one backend. Cheap to clone.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

impl Runner {
    /// Open every channel for `config.runner.url`. Cancelling `token`
    /// closes the runner.
    pub async fn connect(config: &ProfitConfig, token: CancellationToken) -> Result<Self, RunnerError> {
        let url: BackendUrl = config.runner.url.parse()?;
        let endpoint = match (&url.scheme, &url.host) {
            (Scheme::Local, _) | (Scheme::Queue(_), None) => Endpoint::local(config.agent.clone()),
            (_, Some(host)) => Endpoint::ssh(&SshTarget {
                host: host.clone(),
                user: url.user.clone(),
                port: url.port,
                identity_file: config.runner.identity_file.clone(),
                remote_command: config.runner.remote_command.clone(),
            }),
            (_, None) => return Err(UrlError::MissingHost(url.to_string()).into()),
        };
        let id = uuid::Uuid::new_v4().to_string();
        tracing::info!(runner = %id, url = %url, "connecting runner");

        let mut opened = Abandon::default();
        let channels = match open(config, &url, &endpoint, &id, &mut opened).await {
            Ok(channels) => channels,
            Err(e) => {
                tracing::warn!(runner = %id, error = %e, "runner connect failed, closing opened channels");
                opened.close(config.transport.close_timeout()).await;
                return Err(e);
            }
        };
        opened.disarm();

        let inner = Arc::new(RunnerInner {
            id,
            url,
            base: channels.base,
            root_rel: channels.root_rel,
            uploads: channels.uploads,
            downloads: channels.downloads,
            cleanup: channels.cleanup,
            executor: channels.executor,
            batch_size: config.runner.batch_size.max(1),
            close_timeout: config.transport.close_timeout(),
            names: Mutex::new(BatchNameIterator::default()),
            batches: Mutex::new(Vec::new()),
            observers: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
            closed: Event::new(),
        });
        tokio::spawn(watch_token(Arc::downgrade(&inner), inner.closed.clone(), token));
        tracing::info!(runner = %inner.id, root = %inner.worker_path(""), "runner ready");
        Ok(Self { inner })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn url(&self) -> &BackendUrl {
        &self.inner.url
    }

    /// Absolute worker-side runner root.
    pub fn root(&self) -> String {
        self.inner.worker_path("")
    }

    pub fn add_observer(&self, observer: Arc<dyn RunnerObserver>) {
        if let Ok(mut observers) = self.inner.observers.lock() {
            observers.push(observer);
        }
    }

    /// Start a batch and return at once.
    pub fn run_batch(&self, jobs: Vec<JobSpec>) -> Result<BatchHandle, RunnerError> {
        if self.inner.closing.load(Ordering::SeqCst) {
            return Err(RunnerError::RunnerClosed);
        }
        let name = self
            .inner
            .names
            .lock()
            .ok()
            .and_then(|mut names| names.next())
            .ok_or(RunnerError::RunnerClosed)?;
        for observer in self.inner.observers() {
            observer.batch_created(&name, jobs.len());
        }
        let handle = batch::start(self.inner.clone(), name, jobs);
        if let Ok(mut batches) = self.inner.batches.lock() {
            batches.retain(|b| !b.is_finished());
            batches.push(handle.clone());
        }
        Ok(handle)
    }

    pub fn closed(&self) -> &Event {
        &self.inner.closed
    }

    /// Tear everything down. Later calls wait for the first to finish.
    pub async fn close(&self) {
        close(&self.inner).await;
    }
}

async fn close(inner: &RunnerInner) {
    if inner.closing.swap(true, Ordering::SeqCst) {
        inner.closed.wait().await;
        return;
    }
    let limit = inner.close_timeout;
    tracing::info!(runner = %inner.id, "closing runner");

    let batches: Vec<BatchHandle> = inner
        .batches
        .lock()
        .map(|mut b| std::mem::take(&mut *b))
        .unwrap_or_default();
    futures::future::join_all(batches.iter().map(|batch| async move {
        match batch.terminate(limit).await {
            Ok(true) | Err(RunnerError::BatchAlreadyFinished) => {}
            Ok(false) => tracing::warn!(batch = batch.name(), "batch did not stop in time"),
            Err(e) => tracing::warn!(batch = batch.name(), error = %e, "batch terminate failed"),
        }
    }))
    .await;

    inner.executor.close();
    if !inner.executor.waitclose(limit).await {
        tracing::warn!("execution channel close timed out");
    }

    for pool in [inner.uploads.pool(), inner.downloads.pool()] {
        pool.close();
    }
    for pool in [inner.uploads.pool(), inner.downloads.pool()] {
        if !pool.waitclose(limit).await {
            tracing::warn!("transfer pool close timed out");
        }
    }

    if let Err(e) = inner.cleanup.flush().await {
        tracing::warn!(error = %e, "final cleanup flush failed");
    }
    inner.cleanup.close();
    if !inner.cleanup.waitclose(limit).await {
        tracing::warn!("cleanup channel close timed out");
    }

    inner.closed.set();
    tracing::info!(runner = %inner.id, "runner closed");
}

async fn watch_token(inner: Weak<RunnerInner>, closed: Event, token: CancellationToken) {
    tokio::select! {
        _ = closed.wait() => {}
        _ = token.cancelled() => {
            if let Some(inner) = inner.upgrade() {
                tracing::info!(runner = %inner.id, "cancellation requested");
                close(&inner).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_join_without_empty_segments() {
        assert_eq!(join("", "Batch-1"), "Batch-1");
        assert_eq!(join("/tmp/x/", "Batch-1"), "/tmp/x/Batch-1");
        assert_eq!(join("/tmp/x", ""), "/tmp/x");
    }

    #[test]
    fn execution_errors_map_onto_job_outcomes() {
        assert!(matches!(RunnerError::from(RunError::Killed), RunnerError::JobKilled));
        assert!(matches!(
            RunnerError::from(RunError::NonZeroExitStatus(Some(2))),
            RunnerError::NonZeroExitStatus(Some(2))
        ));
        assert!(RunnerError::from(QueueError::Killed).is_killed());
        assert!(matches!(
            RunnerError::from(QueueError::ChannelClosed),
            RunnerError::Queue(QueueError::ChannelClosed)
        ));
    }
}
