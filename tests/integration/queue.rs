use tokio_util::sync::CancellationToken;

use profit_services::{Runner, RunnerError};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Scheduler backend
// ══════════════════════════════════════════════════════════════════════════════

fn slurm_config(scratch: &Scratch) -> profit_core::config::ProfitConfig {
    let bin = install_fake_slurm(scratch);
    let mut config = config(scratch, "slurm://");
    config.agent.queue_bin_dir = bin;
    config.runner.batch_size = 2;
    config
}

/// Five jobs in sub-batches of two become three array submissions, each
/// held, released, run and collected from the job's output directory.
#[tokio::test]
async fn queued_batch_runs_through_array_submissions() {
    let scratch = Scratch::new("slurm-array");
    let config = slurm_config(&scratch);
    let runner = Runner::connect(&config, CancellationToken::new()).await.unwrap();

    let specs: Vec<_> = (0..5)
        .map(|i| write_job(&scratch, &format!("q{i}"), &format!("echo {i} > output.res")))
        .collect();
    let report = within(90, runner.run_batch(specs).unwrap().wait()).await;

    for (i, job) in report.jobs.iter().enumerate() {
        assert!(job.result.is_ok(), "{}: {:?}", job.name, job.result);
        assert_eq!(read_trimmed(job.output_path.join("output.res")).unwrap(), i.to_string());
        assert_eq!(read_trimmed(job.output_path.join("STATUS")).unwrap(), "0");
    }
    assert_eq!(read_trimmed(scratch.path("bin/counter")).unwrap(), "103");
    let script = std::fs::read_to_string(scratch.path("bin/101.sh")).unwrap();
    assert!(script.contains("#SBATCH --array=1-2"));

    within(30, runner.close()).await;
    assert_eq!(entries(&scratch.path("work")), 0);
}

/// The exit status a queued job writes decides its outcome.
#[tokio::test]
async fn queued_job_status_file_reports_failure() {
    let scratch = Scratch::new("slurm-status");
    let config = slurm_config(&scratch);
    let runner = Runner::connect(&config, CancellationToken::new()).await.unwrap();

    let report = within(
        60,
        runner
            .run_batch(vec![write_job(&scratch, "fails", "exit 2")])
            .unwrap()
            .wait(),
    )
    .await;
    assert!(matches!(report.jobs[0].result, Err(RunnerError::NonZeroExitStatus(Some(2)))));

    within(30, runner.close()).await;
}

#[tokio::test]
async fn unknown_scheduler_fails_the_connection() {
    let scratch = Scratch::new("slurm-missing");
    // No stand-ins installed, and an empty bin dir hides any real scheduler.
    let mut config = config(&scratch, "queue://");
    config.agent.queue_bin_dir = scratch.dir("empty-bin");
    let refused = Runner::connect(&config, CancellationToken::new()).await;
    assert!(matches!(refused, Err(RunnerError::Connect(_))));
}

#[tokio::test]
async fn failed_connect_leaves_no_runner_root() {
    let scratch = Scratch::new("slurm-leftover");
    let base = scratch.dir("remote");
    std::fs::write(base.join("keep.txt"), "mine").unwrap();
    // The runner root exists by the time the scheduler check fails.
    let mut config = config(&scratch, &format!("queue://{}", base.display()));
    config.agent.queue_bin_dir = scratch.dir("empty-bin");
    let refused = within(30, Runner::connect(&config, CancellationToken::new())).await;
    assert!(matches!(refused, Err(RunnerError::Connect(_))));
    assert_eq!(entries(&base), 1);
    assert!(base.join("keep.txt").exists());
}
