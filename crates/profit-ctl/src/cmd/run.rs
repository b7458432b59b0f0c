//! Run local job directories as one batch.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use profit_core::config::ProfitConfig;
use profit_services::runner::{BatchReport, RunnerObserver};
use profit_services::JobSpec;

struct Progress;

impl RunnerObserver for Progress {
    fn batch_created(&self, name: &str, jobs: usize) {
        println!("  {name}: {jobs} job(s) started");
    }

    fn batch_finished(&self, report: &BatchReport) {
        let failed = report.failures().count();
        println!("  {}: {} ok, {} failed", report.name, report.jobs.len() - failed, failed);
    }
}

/// Results for `source` land in `<out>/<basename>`.
fn job_spec(source: &Path, out: &Path) -> Result<JobSpec> {
    let source = source
        .canonicalize()
        .with_context(|| format!("job directory {} not found", source.display()))?;
    let name = source
        .file_name()
        .with_context(|| format!("{} has no directory name", source.display()))?;
    Ok(JobSpec::new(&source, out.join(name)))
}

/// Returns whether every job succeeded.
pub async fn cmd_run(config: &ProfitConfig, jobs: &[PathBuf], out: &Path) -> Result<bool> {
    let specs = jobs
        .iter()
        .map(|dir| job_spec(dir, out))
        .collect::<Result<Vec<_>>>()?;

    let runner = super::connect(config).await?;
    runner.add_observer(Arc::new(Progress));

    println!("═══════════════════════════════════════");
    println!("  Running on {}", runner.url());
    println!("═══════════════════════════════════════");

    let batch = runner.run_batch(specs)?;
    let report = batch.wait().await;
    runner.close().await;

    for job in &report.jobs {
        match &job.result {
            Ok(()) => println!("  ✓ {}  → {}", job.name, job.output_path.display()),
            Err(e) => println!("  ✗ {}  {}", job.name, e),
        }
    }
    let ok = report.lock_error.is_none() && !report.killed && report.failures().next().is_none();
    if let Err(e) = report.into_result() {
        println!("\n  Batch failed: {e}");
    }
    Ok(ok)
}
