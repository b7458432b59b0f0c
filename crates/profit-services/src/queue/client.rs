use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::AbortHandle;

use profit_core::queue::{QueueRequest, QueueResponse, QSELECT_ROUTE};
use profit_core::StartMessage;

use crate::channel::{Channel, ChannelError, ChannelOptions, QueueProtocol};
use crate::dispatch::Subscription;
use crate::event::Event;
use crate::transport::Endpoint;

use super::state::{Membership, QueueState};
use super::{QueueError, QueueSettings};

fn channel_error(e: ChannelError) -> QueueError {
    match e {
        ChannelError::Closed => QueueError::ChannelClosed,
        other => QueueError::Protocol(other.to_string()),
    }
}

struct Inner {
    channel: Channel<QueueProtocol>,
    state: Arc<QueueState>,
    base: String,
    counter: AtomicU64,
    kill_timeout: Duration,
    header_lines: Vec<String>,
    poller: AbortHandle,
}

impl Inner {
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.base)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

/// Client side of a queueing channel. Cheap to clone.
#[derive(Clone)]
pub struct QueueClient {
    inner: Arc<Inner>,
}

impl QueueClient {
    pub async fn connect(
        endpoint: &Endpoint,
        settings: &QueueSettings,
        options: &ChannelOptions,
    ) -> Result<Self, ChannelError> {
        let base = uuid::Uuid::new_v4().to_string();
        let start = StartMessage::StartQueueingChannel {
            channel_id: format!("queue-{base}"),
            backend: settings.backend.clone(),
            poll_interval: Some(settings.poll_interval.as_secs().max(1)),
        };
        let channel: Channel<QueueProtocol> = Channel::connect(endpoint, start, options).await?;
        let snapshots = channel.routes().register(QSELECT_ROUTE)?;
        let state = Arc::new(QueueState::new());
        let poller = tokio::spawn(follow_snapshots(snapshots, state.clone())).abort_handle();
        tracing::info!(backend = ?channel.backend(), "queueing channel ready");

        let client = Self {
            inner: Arc::new(Inner {
                channel,
                state,
                base,
                counter: AtomicU64::new(0),
                kill_timeout: settings.kill_timeout,
                header_lines: settings.header_lines.clone(),
                poller,
            }),
        };
        client.poll()?;
        Ok(client)
    }

    /// Scheduler the worker is driving.
    pub fn backend(&self) -> Option<&str> {
        self.inner.channel.backend()
    }

    pub fn state(&self) -> &QueueState {
        &self.inner.state
    }

    /// Ask for a snapshot now instead of waiting for the next broadcast.
    pub fn poll(&self) -> Result<(), ChannelError> {
        self.inner.channel.send(&QueueRequest::Qselect {
            transaction_id: Some(self.inner.next_id()),
        })
    }

    /// Submit `jobs` (worker-side job directories) as one held array job.
    pub fn submit(&self, jobs: Vec<String>) -> Result<QueueJob, QueueError> {
        self.submit_job(jobs, None)
    }

    /// Like [`submit`](Self::submit); `callback` receives the outcome exactly once.
    pub fn submit_then<F>(&self, jobs: Vec<String>, callback: F) -> Result<QueueJob, QueueError>
    where
        F: FnOnce(Result<(), QueueError>) + Send + 'static,
    {
        self.submit_job(jobs, Some(Box::new(callback)))
    }

    pub fn close(&self) {
        self.inner.channel.close();
    }

    pub async fn waitclose(&self, limit: Duration) -> bool {
        self.inner.channel.waitclose(limit).await
    }

    fn submit_job(&self, jobs: Vec<String>, callback: Option<Callback>) -> Result<QueueJob, QueueError> {
        let transaction_id = self.inner.next_id();
        // Listen before submitting so no snapshot naming the job is missed.
        let events = self.inner.state.subscribe();
        let count = jobs.len();
        let sub = self
            .inner
            .channel
            .request(
                transaction_id.clone(),
                &QueueRequest::Qsub {
                    transaction_id: transaction_id.clone(),
                    jobs,
                    header_lines: self.inner.header_lines.clone(),
                },
            )
            .map_err(channel_error)?;
        tracing::debug!(transaction_id, jobs = count, "submitted to scheduler");

        let record = Arc::new(Record {
            transaction_id,
            scheduler_id: OnceLock::new(),
            id_known: Event::new(),
            submitted: Event::new(),
            completion: Event::new(),
            outcome: OnceLock::new(),
            killed: AtomicBool::new(false),
            released: AtomicBool::new(false),
            callback: Mutex::new(callback),
        });
        tokio::spawn(track(record.clone(), self.inner.clone(), sub, events));
        Ok(QueueJob {
            record,
            client: self.inner.clone(),
        })
    }
}

/// Feed every `QSELECT` snapshot into the membership state.
async fn follow_snapshots(mut sub: Subscription<QueueResponse>, state: Arc<QueueState>) {
    while let Some(msg) = sub.recv().await {
        match msg {
            QueueResponse::Qselect { job_ids, .. } => {
                state.apply(job_ids);
            }
            other => tracing::debug!(?other, "ignoring non-snapshot on poll route"),
        }
    }
    tracing::debug!("queue snapshots ended");
}

type Callback = Box<dyn FnOnce(Result<(), QueueError>) + Send>;

struct Record {
    transaction_id: String,
    scheduler_id: OnceLock<String>,
    id_known: Event,
    submitted: Event,
    completion: Event,
    outcome: OnceLock<Result<(), QueueError>>,
    killed: AtomicBool,
    released: AtomicBool,
    callback: Mutex<Option<Callback>>,
}

impl Record {
    fn finish(&self, outcome: Result<(), QueueError>) {
        if self.outcome.set(outcome.clone()).is_err() {
            return;
        }
        match &outcome {
            Ok(()) => tracing::debug!(transaction_id = %self.transaction_id, "queued job left the queue"),
            Err(e) => tracing::debug!(transaction_id = %self.transaction_id, error = %e, "queued job failed"),
        }
        self.completion.set();
        let callback = self.callback.lock().ok().and_then(|mut cb| cb.take());
        if let Some(callback) = callback {
            callback(outcome);
        }
    }
}

enum Watch {
    Matched,
    Finished,
    Closed,
}

/// Wait for a membership change naming `id`. `pick` selects the side of the
/// change to look at, `fallback` decides from the snapshot after a lag.
async fn watch_for(
    record: &Record,
    state: &QueueState,
    events: &mut broadcast::Receiver<Arc<Membership>>,
    pick: impl Fn(&Membership) -> bool,
    fallback: impl Fn(&QueueState) -> bool,
) -> Watch {
    loop {
        let event = tokio::select! {
            _ = record.completion.wait() => return Watch::Finished,
            event = events.recv() => event,
        };
        match event {
            Ok(change) if pick(&change) => return Watch::Matched,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "membership listener lagged, checking snapshot");
                if fallback(state) {
                    return Watch::Matched;
                }
            }
            Err(RecvError::Closed) => return Watch::Closed,
        }
    }
}

async fn track(
    record: Arc<Record>,
    client: Arc<Inner>,
    mut sub: Subscription<QueueResponse>,
    mut events: broadcast::Receiver<Arc<Membership>>,
) {
    let reply = tokio::select! {
        _ = record.completion.wait() => return,
        reply = sub.recv() => reply,
    };
    let id = match reply {
        Some(QueueResponse::Qsub { job_id, .. }) => job_id,
        Some(QueueResponse::Error {
            reason, error_code, ..
        }) => {
            return record.finish(Err(QueueError::Scheduler {
                reason,
                code: error_code,
            }))
        }
        Some(other) => return record.finish(Err(QueueError::Protocol(format!("unexpected {other:?}")))),
        None => return record.finish(Err(QueueError::ChannelClosed)),
    };
    drop(sub);
    let _ = record.scheduler_id.set(id.clone());
    record.id_known.set();
    tracing::debug!(transaction_id = %record.transaction_id, job_id = %id, "scheduler id assigned");

    if !client.state.contains(&id) {
        let seen = watch_for(
            &record,
            &client.state,
            &mut events,
            |change| change.added.contains(&id),
            |state| state.contains(&id),
        )
        .await;
        match seen {
            Watch::Matched => {}
            Watch::Finished => return,
            Watch::Closed => return record.finish(Err(QueueError::ChannelClosed)),
        }
    }
    release(&client, &record, &id);

    let gone = watch_for(
        &record,
        &client.state,
        &mut events,
        |change| change.removed.contains(&id),
        |state| !state.contains(&id),
    )
    .await;
    match gone {
        Watch::Matched if record.killed.load(Ordering::SeqCst) => record.finish(Err(QueueError::Killed)),
        Watch::Matched => record.finish(Ok(())),
        Watch::Finished => {}
        Watch::Closed => record.finish(Err(QueueError::ChannelClosed)),
    }
}

/// `QRLS` the job, once. The reply is only logged.
fn release(client: &Arc<Inner>, record: &Record, id: &str) {
    if record.released.swap(true, Ordering::SeqCst) {
        return;
    }
    let transaction_id = client.next_id();
    let request = QueueRequest::Qrls {
        transaction_id: transaction_id.clone(),
        job_id: id.to_string(),
    };
    match client.channel.request(transaction_id, &request) {
        Ok(mut sub) => {
            let job_id = id.to_string();
            tokio::spawn(async move {
                if let Some(QueueResponse::Error { reason, .. }) = sub.recv().await {
                    tracing::warn!(job_id, %reason, "release failed");
                }
            });
        }
        Err(e) => tracing::warn!(job_id = id, error = %e, "release not sent"),
    }
    tracing::debug!(job_id = id, "released");
    record.submitted.set();
}

/// Handle to one scheduler submission.
#[derive(Clone)]
pub struct QueueJob {
    record: Arc<Record>,
    client: Arc<Inner>,
}

impl QueueJob {
    pub fn transaction_id(&self) -> &str {
        &self.record.transaction_id
    }

    /// Scheduler-assigned id, once known.
    pub fn scheduler_id(&self) -> Option<&str> {
        self.record.scheduler_id.get().map(String::as_str)
    }

    /// Set once the job is visible in the queue and has been released.
    pub fn submitted(&self) -> &Event {
        &self.record.submitted
    }

    pub fn completion(&self) -> &Event {
        &self.record.completion
    }

    pub fn is_finished(&self) -> bool {
        self.record.completion.is_set()
    }

    pub fn outcome(&self) -> Option<Result<(), QueueError>> {
        self.record.outcome.get().cloned()
    }

    pub async fn wait(&self) -> Result<(), QueueError> {
        self.record.completion.wait().await;
        self.outcome().unwrap_or(Err(QueueError::ChannelClosed))
    }

    /// Cancel the job with a forced `QDEL`. If no scheduler id turns up
    /// within the kill timeout the job is finished as killed without
    /// contacting the scheduler.
    pub async fn kill(&self) -> Result<(), QueueError> {
        if self.is_finished() {
            return Err(QueueError::JobAlreadyFinished);
        }
        self.record.killed.store(true, Ordering::SeqCst);
        let limit = self.client.kill_timeout;

        if !self.record.id_known.wait_timeout(limit).await {
            tracing::debug!(transaction_id = %self.record.transaction_id, "no scheduler id, finishing as killed");
            self.record.finish(Err(QueueError::Killed));
            return Ok(());
        }
        let Some(id) = self.scheduler_id().map(str::to_owned) else {
            self.record.finish(Err(QueueError::Killed));
            return Ok(());
        };

        let transaction_id = self.client.next_id();
        let request = QueueRequest::Qdel {
            transaction_id: transaction_id.clone(),
            job_ids: vec![id.clone()],
            force: true,
        };
        match self.client.channel.request(transaction_id, &request) {
            Ok(mut sub) => match tokio::time::timeout(limit, sub.recv()).await {
                Ok(Some(QueueResponse::Qdel { .. })) => tracing::debug!(job_id = %id, "deleted"),
                Ok(Some(QueueResponse::Error { reason, .. })) => {
                    tracing::warn!(job_id = %id, %reason, "scheduler refused delete")
                }
                Ok(_) => tracing::warn!(job_id = %id, "queue channel closed during delete"),
                Err(_) => tracing::warn!(job_id = %id, ?limit, "delete not acknowledged in time"),
            },
            Err(e) => tracing::warn!(job_id = %id, error = %e, "delete not sent"),
        }
        self.record.finish(Err(QueueError::Killed));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use profit_core::config::AgentConfig;
    use std::os::unix::fs::PermissionsExt;

    /// A Slurm stand-in keeping its queue in a file. Releasing a job
    /// completes it at once.
    fn fake_slurm(name: &str) -> (std::path::PathBuf, Endpoint) {
        let dir = std::env::temp_dir().join(format!("profit-queue-client-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let drop_id = r#"grep -v "^$id\$" "$D/queue" > "$D/queue.tmp"; mv "$D/queue.tmp" "$D/queue""#;
        let scripts = [
            (
                "sbatch",
                "D=$(dirname \"$0\")\nn=$(cat \"$D/counter\" 2>/dev/null || echo 100)\nn=$((n+1))\necho $n > \"$D/counter\"\ncat > \"$D/$n.sh\"\necho $n >> \"$D/queue\"\necho \"Submitted batch job $n\"\n".to_string(),
            ),
            ("squeue", "D=$(dirname \"$0\")\ncat \"$D/queue\" 2>/dev/null\ntrue\n".to_string()),
            ("scontrol", format!("D=$(dirname \"$0\")\nid=$2\n{drop_id}\n")),
            ("scancel", format!("D=$(dirname \"$0\")\nfor id; do :; done\necho $id > \"$D/cancelled\"\n{drop_id}\n")),
        ];
        for (program, body) in scripts {
            let path = dir.join(program);
            std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let agent = AgentConfig {
            queue_bin_dir: dir.clone(),
            ..AgentConfig::default()
        };
        (dir, Endpoint::local(agent))
    }

    fn settings() -> QueueSettings {
        QueueSettings {
            backend: Some("slurm".into()),
            poll_interval: Duration::from_secs(1),
            kill_timeout: Duration::from_secs(5),
            header_lines: vec!["#SBATCH -t 5".into()],
        }
    }

    #[tokio::test]
    async fn submitted_job_is_released_then_completes() {
        let (dir, endpoint) = fake_slurm("complete");
        let client = QueueClient::connect(&endpoint, &settings(), &ChannelOptions::default())
            .await
            .unwrap();
        assert_eq!(client.backend(), Some("slurm"));

        let (tx, rx) = tokio::sync::oneshot::channel();
        let job = client
            .submit_then(vec!["/r/a/job_files".into()], move |outcome| {
                let _ = tx.send(outcome);
            })
            .unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(15), rx).await.unwrap().unwrap();
        assert_eq!(outcome, Ok(()));
        assert_eq!(job.scheduler_id(), Some("101"));
        assert!(job.submitted().is_set());
        assert!(std::fs::read_to_string(dir.join("101.sh")).unwrap().contains("#SBATCH -t 5"));
        assert_eq!(job.kill().await, Err(QueueError::JobAlreadyFinished));

        client.close();
        client.waitclose(Duration::from_secs(5)).await;
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn kill_deletes_with_force_and_reports_killed() {
        let (dir, endpoint) = fake_slurm("kill");
        let client = QueueClient::connect(&endpoint, &settings(), &ChannelOptions::default())
            .await
            .unwrap();
        let job = client.submit(vec!["/r/a/job_files".into(), "/r/b/job_files".into()]).unwrap();
        assert!(job.record.id_known.wait_timeout(Duration::from_secs(5)).await);

        job.kill().await.unwrap();
        assert_eq!(job.wait().await, Err(QueueError::Killed));
        let cancelled = std::fs::read_to_string(dir.join("cancelled")).unwrap();
        assert_eq!(cancelled.trim(), job.scheduler_id().unwrap());

        client.close();
        client.waitclose(Duration::from_secs(5)).await;
        let _ = std::fs::remove_dir_all(&dir);
    }
}
