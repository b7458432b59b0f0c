//! profit integration test harness.
//!
//! Every scenario drives a real Runner over the in-process local backend,
//! so nothing here needs ssh or a scheduler. Scheduler scenarios install
//! shell stand-ins into a scratch bin directory and point the worker at it.
//!
//!   cargo test --test integration
//!
//! Each test owns its scratch directory; nothing is shared between tests.

mod batches;
mod kill;
mod queue;

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};

use profit_core::config::ProfitConfig;
use profit_services::runner::{BatchReport, RunnerObserver};
use profit_services::JobSpec;

// ── Harness ───────────────────────────────────────────────────────────────────

/// A per-test directory, removed on drop.
pub struct Scratch {
    pub root: PathBuf,
}

impl Scratch {
    pub fn new(name: &str) -> Self {
        let root = std::env::temp_dir().join(format!("profit-it-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(&root).expect("create scratch dir");
        Self { root }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Create `rel` and return it.
    pub fn dir(&self, rel: &str) -> PathBuf {
        let path = self.path(rel);
        std::fs::create_dir_all(&path).expect("create scratch subdir");
        path
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

/// Config for a local worker whose temporary roots live in `<scratch>/work`.
pub fn config(scratch: &Scratch, url: &str) -> ProfitConfig {
    let mut config = ProfitConfig::default();
    config.runner.url = url.to_string();
    config.runner.transfer_channels = 2;
    config.agent.work_dir = scratch.dir("work");
    config.agent.hardkill_timeout_secs = 2;
    config.transport.close_timeout_secs = 10;
    config.transport.kill_timeout_secs = 5;
    config.queue.poll_interval_secs = 1;
    config
}

/// A job directory under `<scratch>/jobs/<name>` whose `runjob` is `script`.
pub fn write_job(scratch: &Scratch, name: &str, script: &str) -> JobSpec {
    let dir = scratch.dir(&format!("jobs/{name}"));
    std::fs::write(dir.join("runjob"), format!("{script}\n")).expect("write runjob");
    JobSpec::new(dir, scratch.path(&format!("out/{name}")))
}

pub fn read_trimmed(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(text.trim().to_string())
}

/// Entries left in a directory.
pub fn entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

/// Fail the test instead of hanging it.
pub async fn within<T>(secs: u64, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(secs), fut)
        .await
        .unwrap_or_else(|_| panic!("scenario did not finish within {secs}s"))
}

/// Counts batch notifications.
#[derive(Default)]
pub struct Recorder {
    pub created: Mutex<Vec<String>>,
    pub finished: AtomicUsize,
}

impl RunnerObserver for Recorder {
    fn batch_created(&self, name: &str, _jobs: usize) {
        self.created.lock().unwrap().push(name.to_string());
    }

    fn batch_finished(&self, _report: &BatchReport) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

impl Recorder {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Slurm stand-ins in `<scratch>/bin`. The queue lives in a file; releasing
/// a job runs every array task of its script to completion, then drops it.
pub fn install_fake_slurm(scratch: &Scratch) -> PathBuf {
    let bin = scratch.dir("bin");
    let drop_id = r#"grep -v "^$id\$" "$D/queue" > "$D/queue.tmp"; mv "$D/queue.tmp" "$D/queue""#;
    let scripts = [
        (
            "sbatch",
            r#"D=$(dirname "$0")
n=$(cat "$D/counter" 2>/dev/null || echo 100)
n=$((n+1))
echo $n > "$D/counter"
cat > "$D/$n.sh"
echo $n >> "$D/queue"
echo "Submitted batch job $n""#
                .to_string(),
        ),
        ("squeue", "D=$(dirname \"$0\")\ncat \"$D/queue\" 2>/dev/null\ntrue".to_string()),
        (
            "scontrol",
            format!(
                r#"D=$(dirname "$0")
id=$2
n=$(sed -n 's/^#SBATCH --array=1-\([0-9]*\)$/\1/p' "$D/$id.sh")
if [ -z "$n" ]; then
    bash "$D/$id.sh"
else
    i=1
    while [ $i -le $n ]; do
        SLURM_ARRAY_TASK_ID=$i bash "$D/$id.sh"
        i=$((i+1))
    done
fi
{drop_id}"#
            ),
        ),
        ("scancel", format!("D=$(dirname \"$0\")\nfor id; do :; done\n{drop_id}")),
    ];
    for (program, body) in scripts {
        let path = bin.join(program);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write fake scheduler");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod fake scheduler");
    }
    bin
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[test]
fn scratch_is_removed_on_drop() {
    let root = {
        let scratch = Scratch::new("harness");
        scratch.dir("a/b");
        scratch.root.clone()
    };
    assert!(!root.exists());
}

#[test]
fn fake_slurm_submits_and_lists() {
    let scratch = Scratch::new("fake-slurm");
    let bin = install_fake_slurm(&scratch);
    let out = std::process::Command::new(bin.join("sbatch"))
        .stdin(std::process::Stdio::null())
        .output()
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "Submitted batch job 101");
    let listed = std::process::Command::new(bin.join("squeue")).output().unwrap();
    assert_eq!(String::from_utf8_lossy(&listed.stdout).trim(), "101");
}
