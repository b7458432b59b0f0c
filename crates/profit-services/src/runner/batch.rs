//! Batches: a named group of jobs sharing one locked worker directory.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::cleanup_client::CleanupError;
use crate::event::Event;
use crate::queue::{QueueClient, QueueError, QueueJob};

use super::job::{self, JobContext, JobSpec};
use super::{Executor, RunnerError, RunnerInner};

// ── Names ─────────────────────────────────────────────────────────────────────

/// `Batch-1`, `Batch-2`, ...
#[derive(Debug)]
pub struct BatchNameIterator {
    prefix: String,
    next: u64,
}

impl Default for BatchNameIterator {
    fn default() -> Self {
        Self::new("Batch")
    }
}

impl BatchNameIterator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: 1,
        }
    }
}

impl Iterator for BatchNameIterator {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let name = format!("{}-{}", self.prefix, self.next);
        self.next += 1;
        Some(name)
    }
}

// ── Reports ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// `{batch}-{index}/{count}`, 1-based.
    pub name: String,
    pub output_path: PathBuf,
    pub result: Result<(), RunnerError>,
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub name: String,
    pub jobs: Vec<JobOutcome>,
    /// Terminated before every job finished on its own.
    pub killed: bool,
    /// Set when the batch directory could not be locked; no job ran.
    pub lock_error: Option<CleanupError>,
}

impl BatchReport {
    pub fn failures(&self) -> impl Iterator<Item = &JobOutcome> {
        self.jobs.iter().filter(|j| j.result.is_err())
    }

    /// Collapse into the batch-level result: lock failure first, then kill.
    pub fn into_result(self) -> Result<Vec<JobOutcome>, RunnerError> {
        if let Some(e) = self.lock_error {
            return Err(RunnerError::BatchDirectoryLock(e));
        }
        if self.killed {
            return Err(RunnerError::BatchKilled);
        }
        Ok(self.jobs)
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

struct BatchState {
    name: String,
    token: CancellationToken,
    finished: Event,
    report: OnceLock<BatchReport>,
}

/// Handle to a running batch. Cheap to clone.
#[derive(Clone)]
pub struct BatchHandle {
    state: Arc<BatchState>,
}

impl BatchHandle {
    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn finished(&self) -> &Event {
        &self.state.finished
    }

    pub fn is_finished(&self) -> bool {
        self.state.finished.is_set()
    }

    pub fn report(&self) -> Option<BatchReport> {
        self.state.report.get().cloned()
    }

    pub async fn wait(&self) -> BatchReport {
        self.state.finished.wait().await;
        self.report().unwrap_or_else(|| BatchReport {
            name: self.state.name.clone(),
            jobs: Vec::new(),
            killed: true,
            lock_error: None,
        })
    }

    /// Kill every job still in flight and wait up to `limit` for the batch to
    /// wind down. `Ok(false)` when it did not stop in time.
    pub async fn terminate(&self, limit: Duration) -> Result<bool, RunnerError> {
        if self.is_finished() {
            return Err(RunnerError::BatchAlreadyFinished);
        }
        tracing::info!(batch = %self.state.name, "terminating batch");
        self.state.token.cancel();
        Ok(self.state.finished.wait_timeout(limit).await)
    }
}

pub(super) fn start(runner: Arc<RunnerInner>, name: String, jobs: Vec<JobSpec>) -> BatchHandle {
    let state = Arc::new(BatchState {
        name,
        token: CancellationToken::new(),
        finished: Event::new(),
        report: OnceLock::new(),
    });
    tokio::spawn(run(runner, state.clone(), jobs));
    BatchHandle { state }
}

async fn run(runner: Arc<RunnerInner>, state: Arc<BatchState>, jobs: Vec<JobSpec>) {
    let name = state.name.clone();
    let count = jobs.len();
    tracing::info!(batch = %name, jobs = count, "batch started");

    let report = match runner.cleanup.lock(vec![name.clone()]).await {
        Err(e) => {
            tracing::warn!(batch = %name, error = %e, "batch directory lock refused");
            BatchReport {
                jobs: jobs
                    .into_iter()
                    .enumerate()
                    .map(|(i, spec)| JobOutcome {
                        name: job_name(&name, i, count),
                        output_path: spec.output_path,
                        result: Err(RunnerError::BatchDirectoryLock(e.clone())),
                    })
                    .collect(),
                name: name.clone(),
                killed: false,
                lock_error: Some(e),
            }
        }
        Ok(()) => {
            let batcher = match &runner.executor {
                Executor::Queue(client) => Some(Arc::new(SubBatcher::new(
                    client.clone(),
                    runner.batch_size,
                    count,
                ))),
                Executor::Run(_) => None,
            };
            let outcomes = futures::future::join_all(jobs.into_iter().enumerate().map(|(i, spec)| {
                job::run(JobContext {
                    runner: &runner,
                    batch: &name,
                    name: job_name(&name, i, count),
                    spec,
                    token: state.token.clone(),
                    batcher: batcher.clone(),
                })
            }))
            .await;

            if let Err(e) = runner.cleanup.unlock(vec![name.clone()]).await {
                tracing::warn!(batch = %name, error = %e, "batch directory unlock failed");
            }
            if let Err(e) = runner.cleanup.flush().await {
                tracing::warn!(batch = %name, error = %e, "cleanup flush failed");
            }
            BatchReport {
                name: name.clone(),
                jobs: outcomes,
                killed: state.token.is_cancelled(),
                lock_error: None,
            }
        }
    };

    let failed = report.failures().count();
    tracing::info!(batch = %name, jobs = count, failed, killed = report.killed, "batch finished");
    let _ = state.report.set(report.clone());
    state.finished.set();
    for observer in runner.observers() {
        observer.batch_finished(&report);
    }
}

fn job_name(batch: &str, index: usize, count: usize) -> String {
    format!("{batch}-{}/{count}", index + 1)
}

// ── Sub-batching ──────────────────────────────────────────────────────────────

type Waiter = oneshot::Sender<Result<QueueJob, QueueError>>;

struct Pending {
    jobs: Vec<(String, Waiter)>,
    /// Jobs that have neither registered nor dropped out yet.
    remaining: usize,
}

/// Groups a batch's job directories into array submissions of at most
/// `size`. A group is submitted when it is full or when every job of the
/// batch has either registered or dropped out.
pub(super) struct SubBatcher {
    client: QueueClient,
    size: usize,
    pending: Mutex<Pending>,
}

impl SubBatcher {
    pub(super) fn new(client: QueueClient, size: usize, total: usize) -> Self {
        Self {
            client,
            size: size.max(1),
            pending: Mutex::new(Pending {
                jobs: Vec::new(),
                remaining: total,
            }),
        }
    }

    /// Add a job directory. Resolves to the submission that carries it.
    pub(super) fn register(&self, job_dir: String) -> oneshot::Receiver<Result<QueueJob, QueueError>> {
        let (tx, rx) = oneshot::channel();
        let ready = match self.pending.lock() {
            Ok(mut pending) => {
                pending.jobs.push((job_dir, tx));
                pending.remaining = pending.remaining.saturating_sub(1);
                self.take_if_ready(&mut pending)
            }
            Err(_) => {
                let _ = tx.send(Err(QueueError::Protocol("sub-batch state poisoned".into())));
                None
            }
        };
        if let Some(group) = ready {
            self.submit(group);
        }
        rx
    }

    /// A job left the batch without registering.
    pub(super) fn skip(&self) {
        let ready = self.pending.lock().ok().and_then(|mut pending| {
            pending.remaining = pending.remaining.saturating_sub(1);
            self.take_if_ready(&mut pending)
        });
        if let Some(group) = ready {
            self.submit(group);
        }
    }

    fn take_if_ready(&self, pending: &mut Pending) -> Option<Vec<(String, Waiter)>> {
        let full = pending.jobs.len() >= self.size;
        let last = pending.remaining == 0 && !pending.jobs.is_empty();
        (full || last).then(|| std::mem::take(&mut pending.jobs))
    }

    fn submit(&self, group: Vec<(String, Waiter)>) {
        let (dirs, waiters): (Vec<String>, Vec<Waiter>) = group.into_iter().unzip();
        tracing::debug!(jobs = dirs.len(), "submitting sub-batch");
        let result = self.client.submit(dirs);
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

/// Calls [`SubBatcher::skip`] on drop unless the job registered.
pub(super) struct Registration {
    batcher: Option<Arc<SubBatcher>>,
}

impl Registration {
    pub(super) fn new(batcher: Option<Arc<SubBatcher>>) -> Self {
        Self { batcher }
    }

    pub(super) fn register(&mut self, job_dir: String) -> Option<oneshot::Receiver<Result<QueueJob, QueueError>>> {
        self.batcher.take().map(|b| b.register(job_dir))
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(batcher) = self.batcher.take() {
            batcher.skip();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_names_count_from_one() {
        let names: Vec<String> = BatchNameIterator::default().take(3).collect();
        assert_eq!(names, ["Batch-1", "Batch-2", "Batch-3"]);
    }

    #[test]
    fn job_names_are_one_based() {
        assert_eq!(job_name("Batch-4", 0, 12), "Batch-4-1/12");
        assert_eq!(job_name("Batch-4", 11, 12), "Batch-4-12/12");
    }

    #[test]
    fn lock_failure_outranks_kill() {
        let report = BatchReport {
            name: "Batch-1".into(),
            jobs: Vec::new(),
            killed: true,
            lock_error: Some(CleanupError::Closed),
        };
        assert!(matches!(report.into_result(), Err(RunnerError::BatchDirectoryLock(_))));

        let killed = BatchReport {
            name: "Batch-2".into(),
            jobs: Vec::new(),
            killed: true,
            lock_error: None,
        };
        assert!(matches!(killed.into_result(), Err(RunnerError::BatchKilled)));
    }
}
