use tokio_util::sync::CancellationToken;

use profit_services::{Runner, RunnerError};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Termination
// ══════════════════════════════════════════════════════════════════════════════

/// Terminating a batch of long sleepers kills every job, reports each one
/// exactly once and notifies observers exactly once.
#[tokio::test]
async fn terminated_batch_kills_every_job_once() {
    let scratch = Scratch::new("terminate");
    let runner = Runner::connect(&config(&scratch, "local://"), CancellationToken::new())
        .await
        .unwrap();
    let recorder = Recorder::shared();
    runner.add_observer(recorder.clone());

    let specs: Vec<_> = (0..4)
        .map(|i| write_job(&scratch, &format!("sleeper-{i}"), "sleep 60"))
        .collect();
    let batch = runner.run_batch(specs).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let stopped = within(30, batch.terminate(Duration::from_secs(20))).await.unwrap();
    assert!(stopped);
    let report = batch.wait().await;
    assert!(report.killed);
    assert_eq!(report.jobs.len(), 4);
    for job in &report.jobs {
        assert!(matches!(job.result, Err(RunnerError::JobKilled)), "{}: {:?}", job.name, job.result);
    }
    assert!(matches!(report.clone().into_result(), Err(RunnerError::BatchKilled)));
    // Unlocked and flushed before the batch reported itself finished.
    assert!(!Path::new(&runner.root()).join("Batch-1").exists());

    assert!(matches!(
        batch.terminate(Duration::from_secs(1)).await,
        Err(RunnerError::BatchAlreadyFinished)
    ));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(recorder.finished.load(Ordering::SeqCst), 1);

    within(30, runner.close()).await;
    assert_eq!(entries(&scratch.path("work")), 0);
}

/// Cancelling the runner's token closes it, killing the batch in flight.
#[tokio::test]
async fn cancellation_token_closes_the_runner() {
    let scratch = Scratch::new("token");
    let token = CancellationToken::new();
    let runner = Runner::connect(&config(&scratch, "local://"), token.clone())
        .await
        .unwrap();

    let batch = runner
        .run_batch(vec![write_job(&scratch, "long", "sleep 60")])
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    token.cancel();

    within(40, runner.closed().wait()).await;
    let report = batch.report().expect("batch finished before the runner closed");
    assert!(report.killed);
    assert!(matches!(
        runner.run_batch(Vec::new()),
        Err(RunnerError::RunnerClosed)
    ));
}

/// Closing with nothing running is quick and leaves no root behind.
#[tokio::test]
async fn idle_close_removes_the_temporary_root() {
    let scratch = Scratch::new("idle");
    let runner = Runner::connect(&config(&scratch, "local://"), CancellationToken::new())
        .await
        .unwrap();
    let root = PathBuf::from(runner.root());
    assert!(root.is_dir());
    within(20, runner.close()).await;
    assert!(!root.exists());
}
