//! One job's trip through a runner: lock, upload, execute, download, unlock.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use profit_core::run::STATUS;

use crate::queue::{QueueError, QueueJob};
use crate::transfer::{DirectoryDownloadHandler, DirectoryUploadHandler, Transfer};

use super::batch::{JobOutcome, Registration, SubBatcher};
use super::{Executor, RunnerError, RunnerInner};

/// Worker-side subdirectory holding the uploaded job.
const JOB_FILES: &str = "job_files";
/// Worker-side subdirectory a queued job copies its results into.
const QUEUE_OUTPUT: &str = "output";

/// A local job directory and where its results should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    /// Local directory containing `runjob` and its inputs.
    pub source: PathBuf,
    /// Local directory the results are downloaded into. Created if missing.
    pub output_path: PathBuf,
}

impl JobSpec {
    pub fn new(source: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            output_path: output_path.into(),
        }
    }

    /// Name of the job's directory inside its batch.
    fn dir_name(&self) -> String {
        self.source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "job".to_string())
    }
}

pub(super) struct JobContext<'a> {
    pub(super) runner: &'a RunnerInner,
    /// Batch directory, relative to the runner root.
    pub(super) batch: &'a str,
    pub(super) name: String,
    pub(super) spec: JobSpec,
    pub(super) token: CancellationToken,
    pub(super) batcher: Option<Arc<SubBatcher>>,
}

pub(super) async fn run(ctx: JobContext<'_>) -> JobOutcome {
    let job_rel = format!("{}/{}", ctx.batch, ctx.spec.dir_name());
    let mut registration = Registration::new(ctx.batcher.clone());

    let result = match ctx.runner.cleanup.lock(vec![job_rel.clone()]).await {
        Err(e) => {
            drop(registration);
            Err(RunnerError::from(e))
        }
        Ok(()) => {
            let result = pipeline(&ctx, &job_rel, &mut registration).await;
            // Siblings may be waiting on this job to fill their sub-batch.
            drop(registration);
            if let Err(e) = ctx.runner.cleanup.unlock(vec![job_rel.clone()]).await {
                tracing::warn!(job = %ctx.name, error = %e, "job directory unlock failed");
            }
            result
        }
    };

    match &result {
        Ok(()) => tracing::info!(job = %ctx.name, "job finished"),
        Err(e) => tracing::warn!(job = %ctx.name, error = %e, "job failed"),
    }
    JobOutcome {
        name: ctx.name,
        output_path: ctx.spec.output_path,
        result,
    }
}

async fn pipeline(
    ctx: &JobContext<'_>,
    job_rel: &str,
    registration: &mut Registration,
) -> Result<(), RunnerError> {
    let runner = ctx.runner;
    let files_rel = format!("{job_rel}/{JOB_FILES}");

    tracing::debug!(job = %ctx.name, source = %ctx.spec.source.display(), "uploading");
    let upload = runner.uploads.start_upload(DirectoryUploadHandler::new(
        &ctx.spec.source,
        runner.transfer_path(&files_rel),
    ));
    cancellable(ctx, upload).await?;

    let executed = match &runner.executor {
        Executor::Run(client) => {
            let handle = client.start(&runner.worker_path(&files_rel))?;
            tracing::debug!(job = %ctx.name, job_id = handle.job_id(), "started");
            tokio::select! {
                r = handle.wait() => r,
                _ = ctx.token.cancelled() => {
                    if let Err(e) = handle.kill().await {
                        tracing::debug!(job = %ctx.name, error = %e, "kill after completion");
                    }
                    handle.wait().await
                }
            }
            .map_err(RunnerError::from)
        }
        Executor::Queue(_) => {
            let submission = registration
                .register(runner.worker_path(&files_rel))
                .ok_or_else(|| RunnerError::Connect("queued job has no sub-batch".into()))?;
            execute_queued(ctx, submission).await
        }
    };
    if matches!(executed, Err(RunnerError::JobKilled)) {
        return executed;
    }

    tokio::fs::create_dir_all(&ctx.spec.output_path)
        .await
        .map_err(|e| RunnerError::Io {
            path: ctx.spec.output_path.clone(),
            source: Arc::new(e),
        })?;
    let results_rel = match runner.executor {
        Executor::Run(_) => files_rel,
        Executor::Queue(_) => format!("{job_rel}/{QUEUE_OUTPUT}"),
    };
    let results = runner.transfer_path(&results_rel);
    tracing::debug!(job = %ctx.name, output = %ctx.spec.output_path.display(), "downloading");
    let download = runner.downloads.start_download(
        &results,
        DirectoryDownloadHandler::new(&results, &ctx.spec.output_path),
    );
    cancellable(ctx, download).await?;

    executed?;
    if let Executor::Queue(_) = runner.executor {
        check_status(&ctx.spec.output_path).await?;
    }
    Ok(())
}

/// Wait for `transfer`; cancel it and report a kill when the batch is
/// terminated first.
async fn cancellable(ctx: &JobContext<'_>, transfer: Transfer) -> Result<(), RunnerError> {
    tokio::select! {
        r = transfer.wait() => r.map_err(RunnerError::from),
        _ = ctx.token.cancelled() => {
            if !transfer.cancel().wait_timeout(ctx.runner.close_timeout).await {
                tracing::warn!(job = %ctx.name, "transfer did not stop in time");
            }
            Err(RunnerError::JobKilled)
        }
    }
}

async fn execute_queued(
    ctx: &JobContext<'_>,
    mut submission: oneshot::Receiver<Result<QueueJob, QueueError>>,
) -> Result<(), RunnerError> {
    let submitted = tokio::select! {
        r = &mut submission => r,
        _ = ctx.token.cancelled() => {
            // Siblings drop out quickly once the batch is cancelled, so the
            // sub-batch still gets submitted and has to be deleted.
            match tokio::time::timeout(ctx.runner.close_timeout, submission).await {
                Ok(Ok(Ok(job))) => {
                    let _ = job.kill().await;
                }
                _ => tracing::warn!(job = %ctx.name, "sub-batch never submitted"),
            }
            return Err(RunnerError::JobKilled);
        }
    };
    let job = submitted.map_err(|_| RunnerError::Queue(QueueError::ChannelClosed))??;
    tracing::debug!(job = %ctx.name, transaction_id = job.transaction_id(), "queued");
    tokio::select! {
        r = job.wait() => r,
        _ = ctx.token.cancelled() => {
            if let Err(e) = job.kill().await {
                tracing::debug!(job = %ctx.name, error = %e, "kill after completion");
            }
            job.wait().await
        }
    }
    .map_err(RunnerError::from)
}

/// A queued job's exit status, as written by the array script.
async fn check_status(output: &Path) -> Result<(), RunnerError> {
    let path = output.join(STATUS);
    let text = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| RunnerError::Io {
            path: path.clone(),
            source: Arc::new(e),
        })?;
    match text.trim().parse::<i32>() {
        Ok(0) => Ok(()),
        Ok(code) => Err(RunnerError::NonZeroExitStatus(Some(code))),
        Err(_) => Err(RunnerError::NonZeroExitStatus(None)),
    }
}
