//! Run agent — launches `runjob` in job directories with bounded concurrency.
//!
//! Each `JOB_START` gets its own task. The task waits for a slot, spawns
//! `<shell> runjob`, reports the pid, and on exit writes `STATUS` and replies
//! `JOB_END`. `JOB_KILL` cancels the task's token: a queued job ends as
//! killed without running, a running one gets SIGTERM and, after the
//! hard-kill timeout, SIGKILL.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{access, AccessFlags, Pid};
use tokio::process::{Child, Command};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use profit_core::run::{RunRequest, RunResponse, RUNJOB, STATUS, STDERR, STDOUT};
use profit_core::wire::codes;
use profit_core::StartReply;

use super::{Agent, Outbox, Rejection};

pub(crate) struct RunAgent {
    channel_id: String,
    shell: PathBuf,
    hardkill: Duration,
    slots: Arc<Semaphore>,
    jobs: Arc<DashMap<String, CancellationToken>>,
    tasks: JoinSet<()>,
}

/// Resolve `shell` to an executable path, searching `PATH` for bare names.
fn find_executable(shell: &str) -> Option<PathBuf> {
    let executable = |p: &Path| p.is_file() && access(p, AccessFlags::X_OK).is_ok();
    if shell.contains('/') {
        let path = PathBuf::from(shell);
        return executable(&path).then_some(path);
    }
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(shell))
            .find(|p| executable(p))
    })
}

impl RunAgent {
    pub(crate) fn start(
        channel_id: String,
        shell: String,
        hardkill_timeout: u64,
        max_jobs: u32,
    ) -> Result<Self, Rejection> {
        let shell = find_executable(&shell).ok_or_else(|| {
            Rejection::new(codes::JOB_START, format!("shell {shell} is not executable"))
        })?;
        let slots = if max_jobs == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            max_jobs as usize
        };
        tracing::info!(channel_id, slots, shell = %shell.display(), "run agent started");
        Ok(Self {
            channel_id,
            shell,
            hardkill: Duration::from_secs(hardkill_timeout),
            slots: Arc::new(Semaphore::new(slots)),
            jobs: Arc::new(DashMap::new()),
            tasks: JoinSet::new(),
        })
    }
}

struct JobContext {
    channel_id: String,
    job_id: String,
    job_path: PathBuf,
    shell: PathBuf,
    hardkill: Duration,
    slots: Arc<Semaphore>,
    token: CancellationToken,
    out: Outbox,
}

impl JobContext {
    fn end(&self, returncode: Option<i32>, killed: bool) {
        self.out.send(&RunResponse::JobEnd {
            channel_id: self.channel_id.clone(),
            job_id: self.job_id.clone(),
            returncode,
            killed,
        });
    }

    fn start_error(&self, reason: String) {
        tracing::warn!(job_id = %self.job_id, %reason, "job failed to start");
        self.out.send(&RunResponse::JobStartError {
            channel_id: self.channel_id.clone(),
            job_id: self.job_id.clone(),
            reason,
        });
    }

    fn spawn_child(&self) -> std::io::Result<Child> {
        let stdout = std::fs::File::create(self.job_path.join(STDOUT))?;
        let stderr = std::fs::File::create(self.job_path.join(STDERR))?;
        Command::new(&self.shell)
            .arg(RUNJOB)
            .current_dir(&self.job_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
    }
}

/// SIGTERM the job's process group, then SIGKILL once `hardkill` has passed.
async fn terminate(child: &mut Child, hardkill: Duration) -> std::io::Result<ExitStatus> {
    let group = child.id().map(|pid| Pid::from_raw(pid as i32));
    if let Some(group) = group {
        if let Err(e) = killpg(group, Signal::SIGTERM) {
            tracing::debug!(pid = group.as_raw(), error = %e, "SIGTERM failed");
        }
    }
    match tokio::time::timeout(hardkill, child.wait()).await {
        Ok(status) => {
            // Stragglers the shell left behind.
            if let Some(group) = group {
                let _ = killpg(group, Signal::SIGKILL);
            }
            status
        }
        Err(_) => {
            tracing::warn!(pid = child.id(), "job ignored SIGTERM, killing");
            if let Some(group) = group {
                let _ = killpg(group, Signal::SIGKILL);
            }
            child.kill().await?;
            child.wait().await
        }
    }
}

async fn run_job(ctx: JobContext) {
    let _permit = tokio::select! {
        biased;
        _ = ctx.token.cancelled() => {
            tracing::debug!(job_id = %ctx.job_id, "job killed while queued");
            return ctx.end(None, true);
        }
        permit = ctx.slots.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return ctx.end(None, true),
        },
    };

    let mut child = match ctx.spawn_child() {
        Ok(child) => child,
        Err(e) => return ctx.start_error(format!("failed to launch {RUNJOB}: {e}")),
    };
    let pid = child.id().unwrap_or_default();
    tracing::debug!(job_id = %ctx.job_id, pid, "job started");
    ctx.out.send(&RunResponse::JobStart {
        channel_id: ctx.channel_id.clone(),
        job_id: ctx.job_id.clone(),
        pid,
    });

    let (status, killed) = tokio::select! {
        status = child.wait() => (status, false),
        _ = ctx.token.cancelled() => (terminate(&mut child, ctx.hardkill).await, true),
    };
    let status = match status {
        Ok(status) => status,
        Err(e) => {
            tracing::error!(job_id = %ctx.job_id, error = %e, "lost track of job process");
            return ctx.end(None, killed);
        }
    };

    let code = status
        .code()
        .or_else(|| status.signal().map(|s| -s))
        .unwrap_or(-1);
    if let Err(e) = tokio::fs::write(ctx.job_path.join(STATUS), format!("{code}\n")).await {
        tracing::warn!(job_id = %ctx.job_id, error = %e, "failed to write STATUS");
    }
    tracing::debug!(job_id = %ctx.job_id, code, killed, "job finished");
    ctx.end(status.code(), killed);
}

#[async_trait]
impl Agent for RunAgent {
    type Request = RunRequest;

    fn ready(&self) -> StartReply {
        StartReply::Ready {
            channel_id: self.channel_id.clone(),
            remote_path: None,
            backend: None,
        }
    }

    async fn handle(&mut self, request: RunRequest, out: &Outbox) {
        // Reap finished job tasks so the set stays small.
        while self.tasks.try_join_next().is_some() {}

        match request {
            RunRequest::JobStart { job_id, job_path } => {
                let job_path = PathBuf::from(job_path);
                if !job_path.join(RUNJOB).is_file() {
                    out.send(&RunResponse::JobStartError {
                        channel_id: self.channel_id.clone(),
                        job_id,
                        reason: format!("PATH_ERROR: no {RUNJOB} in {}", job_path.display()),
                    });
                    return;
                }
                let token = CancellationToken::new();
                if self.jobs.contains_key(&job_id) {
                    out.send(&RunResponse::JobStartError {
                        channel_id: self.channel_id.clone(),
                        job_id,
                        reason: "job id already in use".into(),
                    });
                    return;
                }
                self.jobs.insert(job_id.clone(), token.clone());

                let ctx = JobContext {
                    channel_id: self.channel_id.clone(),
                    job_id: job_id.clone(),
                    job_path,
                    shell: self.shell.clone(),
                    hardkill: self.hardkill,
                    slots: self.slots.clone(),
                    token,
                    out: out.clone(),
                };
                let jobs = self.jobs.clone();
                self.tasks.spawn(async move {
                    run_job(ctx).await;
                    jobs.remove(&job_id);
                });
            }
            RunRequest::JobKill { job_id } => match self.jobs.get(&job_id) {
                Some(token) => {
                    tracing::debug!(job_id, "kill requested");
                    token.cancel();
                }
                None => out.send(&RunResponse::Error {
                    job_id: Some(job_id.clone()),
                    reason: format!("no running job {job_id}"),
                    error_code: codes::KEY_ERROR.into(),
                }),
            },
        }
    }

    async fn shutdown(&mut self, _out: &Outbox) {
        for job in self.jobs.iter() {
            job.value().cancel();
        }
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "job task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_lookup_searches_path() {
        assert!(find_executable("sh").is_some());
        assert!(find_executable("/bin/sh").is_some());
        assert!(find_executable("/definitely/not/a/shell").is_none());
    }

    #[test]
    fn unusable_shell_refuses_start() {
        let err = RunAgent::start("r".into(), "/nonexistent/shell".into(), 1, 1)
            .err()
            .unwrap();
        assert_eq!(err.code, codes::JOB_START);
    }
}
