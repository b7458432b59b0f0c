use tokio_util::sync::CancellationToken;

use profit_services::{Runner, RunnerError};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Local batches
// ══════════════════════════════════════════════════════════════════════════════

/// Twelve jobs each echo their index. Every output directory gets the
/// result file and a zero status, and closing the runner leaves nothing
/// behind on the worker.
#[tokio::test]
async fn twelve_local_jobs_echo_their_ids() {
    let scratch = Scratch::new("twelve");
    let config = config(&scratch, "local://");
    let runner = Runner::connect(&config, CancellationToken::new()).await.unwrap();
    assert!(runner.root().starts_with(&scratch.path("work").display().to_string()));

    let specs: Vec<_> = (0..12)
        .map(|i| write_job(&scratch, &format!("job-{i}"), &format!("echo {i} > output.res")))
        .collect();
    let batch = runner.run_batch(specs).unwrap();
    assert_eq!(batch.name(), "Batch-1");

    let report = within(60, batch.wait()).await;
    assert!(!report.killed);
    assert_eq!(report.jobs.len(), 12);
    for (i, job) in report.jobs.iter().enumerate() {
        assert!(job.result.is_ok(), "{}: {:?}", job.name, job.result);
        assert_eq!(job.name, format!("Batch-1-{}/12", i + 1));
        assert_eq!(read_trimmed(job.output_path.join("STATUS")).unwrap(), "0");
        assert_eq!(read_trimmed(job.output_path.join("output.res")).unwrap(), i.to_string());
        assert!(job.output_path.join("runjob").exists());
    }

    within(30, runner.close()).await;
    assert!(runner.closed().is_set());
    assert_eq!(entries(&scratch.path("work")), 0);
}

/// A failing job still gets its outputs and reports its exit status; its
/// siblings are unaffected.
#[tokio::test]
async fn nonzero_exit_is_reported_with_outputs() {
    let scratch = Scratch::new("nonzero");
    let runner = Runner::connect(&config(&scratch, "local://"), CancellationToken::new())
        .await
        .unwrap();

    let batch = runner
        .run_batch(vec![
            write_job(&scratch, "good", "echo fine > output.res"),
            write_job(&scratch, "bad", "echo partial > output.res\nexit 3"),
        ])
        .unwrap();
    let report = within(30, batch.wait()).await;

    assert!(report.jobs[0].result.is_ok());
    assert!(matches!(report.jobs[1].result, Err(RunnerError::NonZeroExitStatus(Some(3)))));
    assert_eq!(read_trimmed(report.jobs[1].output_path.join("STATUS")).unwrap(), "3");
    assert_eq!(read_trimmed(report.jobs[1].output_path.join("output.res")).unwrap(), "partial");
    assert_eq!(report.failures().count(), 1);
    assert!(report.into_result().is_ok());

    within(30, runner.close()).await;
}

/// With a base path, the runner works in `<base>/<runner id>` and removes
/// only that directory on close.
#[tokio::test]
async fn rooted_runner_cleans_only_its_own_directory() {
    let scratch = Scratch::new("rooted");
    let base = scratch.dir("remote");
    std::fs::write(base.join("keep.txt"), "not ours").unwrap();
    let url = format!("local://{}", base.display());
    let runner = Runner::connect(&config(&scratch, &url), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(runner.root(), base.join(runner.id()).display().to_string());
    assert!(base.join(runner.id()).is_dir());

    let batch = runner
        .run_batch(vec![write_job(&scratch, "one", "echo 1 > output.res")])
        .unwrap();
    within(30, batch.wait()).await.into_result().unwrap();

    within(30, runner.close()).await;
    assert!(!base.join(runner.id()).exists());
    assert!(base.join("keep.txt").exists());
}

#[tokio::test]
async fn batches_are_named_in_order_and_observed() {
    let scratch = Scratch::new("observed");
    let runner = Runner::connect(&config(&scratch, "local://"), CancellationToken::new())
        .await
        .unwrap();
    let recorder = Recorder::shared();
    runner.add_observer(recorder.clone());

    for round in 0..2 {
        let batch = runner
            .run_batch(vec![write_job(&scratch, &format!("r{round}"), "true")])
            .unwrap();
        within(30, batch.wait()).await;
        assert!(matches!(
            batch.terminate(Duration::from_secs(1)).await,
            Err(RunnerError::BatchAlreadyFinished)
        ));
    }

    assert_eq!(*recorder.created.lock().unwrap(), ["Batch-1", "Batch-2"]);
    // Observers run just after the batch's finished event.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(recorder.finished.load(Ordering::SeqCst), 2);
    within(30, runner.close()).await;
}

#[tokio::test]
async fn closed_runner_refuses_batches() {
    let scratch = Scratch::new("closed");
    let runner = Runner::connect(&config(&scratch, "local://"), CancellationToken::new())
        .await
        .unwrap();
    within(30, runner.close()).await;
    // A second close returns once the first has finished.
    within(5, runner.close()).await;

    let refused = runner.run_batch(vec![write_job(&scratch, "late", "true")]);
    assert!(matches!(refused, Err(RunnerError::RunnerClosed)));
}

#[tokio::test]
async fn missing_job_directory_fails_only_that_job() {
    let scratch = Scratch::new("missing");
    let runner = Runner::connect(&config(&scratch, "local://"), CancellationToken::new())
        .await
        .unwrap();
    let mut specs = vec![write_job(&scratch, "present", "echo here > output.res")];
    specs.push(profit_services::JobSpec::new(
        scratch.path("jobs/absent"),
        scratch.path("out/absent"),
    ));

    let report = within(30, runner.run_batch(specs).unwrap().wait()).await;
    assert!(report.jobs[0].result.is_ok());
    assert!(matches!(report.jobs[1].result, Err(RunnerError::Transfer(_))));

    within(30, runner.close()).await;
}
