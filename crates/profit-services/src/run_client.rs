//! Run client. Starts `runjob` in job directories through a run agent.
//!
//! Every job gets a transaction id from a per-client base plus a counter,
//! a route for its replies, and a small task that turns those replies into
//! one terminal outcome. The outcome is published exactly once: later
//! replies for the same job (a duplicate `JOB_END`, a late `JOB_START`) find
//! it already set and are dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use profit_core::run::{RunRequest, RunResponse};
use profit_core::StartMessage;

use crate::channel::{Channel, ChannelError, ChannelOptions, RunProtocol};
use crate::dispatch::Subscription;
use crate::event::Event;
use crate::transport::Endpoint;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    #[error("job failed to start: {0}")]
    JobStart(String),
    #[error("job exited with status {}", .0.map_or("<signal>".to_string(), |c| c.to_string()))]
    NonZeroExitStatus(Option<i32>),
    #[error("job killed")]
    Killed,
    #[error("run protocol error: {0}")]
    Protocol(String),
    #[error("run channel closed")]
    ChannelClosed,
    #[error("job already finished")]
    JobAlreadyFinished,
}

/// Parameters of the run agent's handshake.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub shell: String,
    pub hardkill_timeout: Duration,
    /// 0 = the worker's available parallelism.
    pub max_jobs: u32,
    /// Bound on waiting for a kill to be acknowledged.
    pub kill_timeout: Duration,
}

type Callback = Box<dyn FnOnce(Result<(), RunError>) + Send>;

struct JobState {
    job_id: String,
    pid: OnceLock<u32>,
    pid_set: Event,
    completion: Event,
    outcome: OnceLock<Result<(), RunError>>,
    kill_requested: AtomicBool,
    callback: Mutex<Option<Callback>>,
}

impl JobState {
    /// Publish the terminal outcome. Only the first call has any effect.
    fn finish(&self, outcome: Result<(), RunError>) -> bool {
        if self.outcome.set(outcome.clone()).is_err() {
            return false;
        }
        match &outcome {
            Ok(()) => tracing::debug!(job_id = %self.job_id, "job finished"),
            Err(e) => tracing::debug!(job_id = %self.job_id, error = %e, "job failed"),
        }
        self.completion.set();
        let callback = self.callback.lock().ok().and_then(|mut cb| cb.take());
        if let Some(callback) = callback {
            callback(outcome);
        }
        true
    }
}

struct Inner {
    channel: Channel<RunProtocol>,
    base: String,
    counter: AtomicU64,
    kill_timeout: Duration,
}

/// Client side of a run channel. Cheap to clone.
#[derive(Clone)]
pub struct RunClient {
    inner: Arc<Inner>,
}

/// Handle to one submitted job.
#[derive(Clone)]
pub struct JobHandle {
    state: Arc<JobState>,
    client: Arc<Inner>,
}

impl RunClient {
    pub async fn connect(
        endpoint: &Endpoint,
        settings: &RunSettings,
        options: &ChannelOptions,
    ) -> Result<Self, ChannelError> {
        let base = uuid::Uuid::new_v4().to_string();
        let start = StartMessage::StartChannel {
            channel_id: format!("run-{base}"),
            shell: settings.shell.clone(),
            hardkill_timeout: settings.hardkill_timeout.as_secs(),
            max_jobs: settings.max_jobs,
        };
        let channel = Channel::connect(endpoint, start, options).await?;
        Ok(Self {
            inner: Arc::new(Inner {
                channel,
                base,
                counter: AtomicU64::new(0),
                kill_timeout: settings.kill_timeout,
            }),
        })
    }

    /// Start `runjob` in `job_path` on the worker and return at once.
    pub fn start(&self, job_path: &str) -> Result<JobHandle, RunError> {
        self.start_job(job_path, None)
    }

    /// Like [`start`](Self::start); `callback` receives the outcome exactly once.
    pub fn start_then<F>(&self, job_path: &str, callback: F) -> Result<JobHandle, RunError>
    where
        F: FnOnce(Result<(), RunError>) + Send + 'static,
    {
        self.start_job(job_path, Some(Box::new(callback)))
    }

    /// Run a job to completion.
    pub async fn run(&self, job_path: &str) -> Result<(), RunError> {
        self.start(job_path)?.wait().await
    }

    pub fn close(&self) {
        self.inner.channel.close();
    }

    pub async fn waitclose(&self, limit: Duration) -> bool {
        self.inner.channel.waitclose(limit).await
    }

    fn start_job(&self, job_path: &str, callback: Option<Callback>) -> Result<JobHandle, RunError> {
        let n = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        let job_id = format!("{}-{n}", self.inner.base);
        let request = RunRequest::JobStart {
            job_id: job_id.clone(),
            job_path: job_path.to_string(),
        };
        let sub = self
            .inner
            .channel
            .request(job_id.clone(), &request)
            .map_err(|e| match e {
                ChannelError::Closed => RunError::ChannelClosed,
                other => RunError::Protocol(other.to_string()),
            })?;
        tracing::debug!(job_id, job_path, "job submitted");

        let state = Arc::new(JobState {
            job_id,
            pid: OnceLock::new(),
            pid_set: Event::new(),
            completion: Event::new(),
            outcome: OnceLock::new(),
            kill_requested: AtomicBool::new(false),
            callback: Mutex::new(callback),
        });
        tokio::spawn(track(state.clone(), sub));
        Ok(JobHandle {
            state,
            client: self.inner.clone(),
        })
    }
}

/// Turn the job's replies into its outcome.
async fn track(state: Arc<JobState>, mut sub: Subscription<RunResponse>) {
    loop {
        let msg = tokio::select! {
            _ = state.completion.wait() => return,
            msg = sub.recv() => msg,
        };
        let outcome = match msg {
            None => Err(RunError::ChannelClosed),
            Some(RunResponse::JobStart { pid, .. }) => {
                let _ = state.pid.set(pid);
                state.pid_set.set();
                tracing::debug!(job_id = %state.job_id, pid, "job running");
                continue;
            }
            Some(RunResponse::JobStartError { reason, .. }) => Err(RunError::JobStart(reason)),
            Some(RunResponse::JobEnd {
                returncode, killed, ..
            }) => {
                if killed || state.kill_requested.load(Ordering::SeqCst) {
                    Err(RunError::Killed)
                } else if returncode == Some(0) {
                    Ok(())
                } else {
                    Err(RunError::NonZeroExitStatus(returncode))
                }
            }
            Some(RunResponse::Error { reason, .. }) => Err(RunError::Protocol(reason)),
        };
        state.finish(outcome);
        return;
    }
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.state.job_id
    }

    /// Process id on the worker, once the job is running.
    pub fn pid(&self) -> Option<u32> {
        self.state.pid.get().copied()
    }

    pub fn pid_set(&self) -> &Event {
        &self.state.pid_set
    }

    pub fn completion(&self) -> &Event {
        &self.state.completion
    }

    pub fn is_finished(&self) -> bool {
        self.state.completion.is_set()
    }

    pub fn outcome(&self) -> Option<Result<(), RunError>> {
        self.state.outcome.get().cloned()
    }

    pub async fn wait(&self) -> Result<(), RunError> {
        self.state.completion.wait().await;
        self.outcome().unwrap_or(Err(RunError::ChannelClosed))
    }

    /// Kill the job. A job that has not reported its pid yet is finished as
    /// killed straight away; otherwise the kill acknowledgement is awaited
    /// for at most the client's kill timeout.
    pub async fn kill(&self) -> Result<(), RunError> {
        if self.is_finished() {
            return Err(RunError::JobAlreadyFinished);
        }
        self.state.kill_requested.store(true, Ordering::SeqCst);
        let sent = self.client.channel.send(&RunRequest::JobKill {
            job_id: self.state.job_id.clone(),
        });
        if let Err(e) = sent {
            tracing::debug!(job_id = %self.state.job_id, error = %e, "kill not delivered");
        }
        if self.pid().is_none() {
            self.state.finish(Err(RunError::Killed));
            return Ok(());
        }
        if !self.state.completion.wait_timeout(self.client.kill_timeout).await {
            tracing::warn!(job_id = %self.state.job_id, "kill not acknowledged in time");
            self.state.finish(Err(RunError::Killed));
        }
        Ok(())
    }
}
