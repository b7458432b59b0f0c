//! Scheduler backends as data.
//!
//! PBSPro, Torque, Slurm and SGE differ only in command names, flags, how
//! job ids are printed, and the array-job variables; one [`QueueBackend`]
//! record captures all of that and the queue agent does the rest.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use profit_core::config::AgentConfig;
use profit_core::run::{RUNJOB, STATUS, STDERR, STDOUT};

/// Where the job id sits in submit output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdFormat {
    /// The whole (trimmed) output.
    Whole,
    /// The last whitespace-separated token.
    LastToken,
    /// Everything before the first `.`.
    BeforeDot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBackend {
    pub name: &'static str,
    /// Held submission, script on stdin.
    pub submit: &'static [&'static str],
    pub submit_id: IdFormat,
    pub poll: &'static [&'static str],
    /// Header lines to skip in poll output.
    pub poll_skip: usize,
    pub release: &'static [&'static str],
    pub delete: &'static [&'static str],
    pub force: &'static [&'static str],
    /// Array range flag, joined directly to `1-N`.
    pub array_flag: &'static str,
    /// Environment variable holding the array task index.
    pub array_index: &'static str,
    /// Script directive prefix.
    pub directive: &'static str,
    pub headers: &'static [&'static str],
}

pub const PBSPRO: QueueBackend = QueueBackend {
    name: "pbspro",
    submit: &["qsub", "-h"],
    submit_id: IdFormat::Whole,
    poll: &["qselect"],
    poll_skip: 0,
    release: &["qrls"],
    delete: &["qdel"],
    force: &["-Wforce"],
    array_flag: "-J ",
    array_index: "PBS_ARRAY_INDEX",
    directive: "#PBS",
    headers: &["-N profit", "-j oe"],
};

pub const TORQUE: QueueBackend = QueueBackend {
    name: "torque",
    submit: &["qsub", "-h"],
    submit_id: IdFormat::Whole,
    poll: &["qselect"],
    poll_skip: 0,
    release: &["qrls"],
    delete: &["qdel"],
    force: &["-W", "0"],
    array_flag: "-t ",
    array_index: "PBS_ARRAYID",
    directive: "#PBS",
    headers: &["-N profit", "-j oe"],
};

pub const SLURM: QueueBackend = QueueBackend {
    name: "slurm",
    submit: &["sbatch", "-H"],
    submit_id: IdFormat::LastToken,
    poll: &["squeue", "-h", "-o", "%F"],
    poll_skip: 0,
    release: &["scontrol", "release"],
    delete: &["scancel"],
    force: &["--signal=KILL"],
    array_flag: "--array=",
    array_index: "SLURM_ARRAY_TASK_ID",
    directive: "#SBATCH",
    headers: &["-J profit"],
};

pub const SGE: QueueBackend = QueueBackend {
    name: "sge",
    submit: &["qsub", "-h", "-terse"],
    submit_id: IdFormat::BeforeDot,
    poll: &["qstat"],
    poll_skip: 2,
    release: &["qrls"],
    delete: &["qdel"],
    force: &[],
    array_flag: "-t ",
    array_index: "SGE_TASK_ID",
    directive: "#$",
    headers: &["-N profit", "-j y", "-cwd"],
};

pub const ALL: [&QueueBackend; 4] = [&PBSPRO, &TORQUE, &SLURM, &SGE];

pub fn by_name(name: &str) -> Option<&'static QueueBackend> {
    let name = name.to_ascii_lowercase();
    let name = match name.as_str() {
        "pbs" => "pbspro",
        other => other,
    };
    ALL.into_iter().find(|b| b.name == name)
}

/// Leading digits of a scheduler id: `123.server`, `123[].server`,
/// `123-4.host` and `123_7` all name job `123`.
pub fn normalize_id(raw: &str) -> Option<String> {
    let digits: String = raw.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
    (!digits.is_empty()).then_some(digits)
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

impl QueueBackend {
    /// Raw id as printed by the submit command.
    pub fn parse_submit(&self, output: &str) -> Option<String> {
        let output = output.trim();
        let raw = match self.submit_id {
            IdFormat::Whole => output.lines().last()?.trim(),
            IdFormat::LastToken => output.split_whitespace().last()?,
            IdFormat::BeforeDot => output.split('.').next()?.trim(),
        };
        (!raw.is_empty()).then(|| raw.to_string())
    }

    /// Normalised ids from poll output. Array members collapse onto their parent.
    pub fn parse_poll(&self, output: &str) -> Vec<String> {
        let mut ids: Vec<String> = output
            .lines()
            .skip(self.poll_skip)
            .filter_map(|line| line.split_whitespace().next())
            .filter_map(normalize_id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Array job script running `runjob` in each of `jobs` (absolute job
    /// directories). Results land in `<job>/../output`.
    pub fn render_script(&self, jobs: &[String], header_lines: &[String], shell: &str) -> String {
        let mut lines = vec!["#!/bin/bash".to_string()];
        if jobs.len() > 1 {
            lines.push(format!("{} {}1-{}", self.directive, self.array_flag, jobs.len()));
        }
        lines.extend(self.headers.iter().map(|h| format!("{} {h}", self.directive)));
        lines.extend(header_lines.iter().cloned());
        lines.push(String::new());

        if jobs.len() > 1 {
            for (i, job) in jobs.iter().enumerate() {
                lines.push(format!("JOB_ARRAY[{}]={}", i + 1, shell_quote(job)));
            }
            lines.push(format!("JOB_DIR=\"${{JOB_ARRAY[${}]}}\"", self.array_index));
        } else if let Some(job) = jobs.first() {
            lines.push(format!("JOB_DIR={}", shell_quote(job)));
        }

        lines.extend([
            "SCRATCH=\"$(mktemp -d \"${TMPDIR:-/tmp}/profit.XXXXXX\")\"".to_string(),
            "cp -r \"$JOB_DIR\"/. \"$SCRATCH\"".to_string(),
            "finish() {".to_string(),
            "    mkdir -p \"$JOB_DIR/../output\"".to_string(),
            "    cp -r \"$SCRATCH\"/. \"$JOB_DIR/../output/\"".to_string(),
            "    rm -rf \"$SCRATCH\"".to_string(),
            "}".to_string(),
            "trap finish EXIT".to_string(),
            "cd \"$SCRATCH\"".to_string(),
            format!("{} {RUNJOB} > {STDOUT} 2> {STDERR}", shell_quote(shell)),
            format!("echo $? > {STATUS}"),
        ]);
        let mut script = lines.join("\n");
        script.push('\n');
        script
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// Run one scheduler command. Stdout on success, a description of the
/// failure otherwise.
pub async fn run_command(
    config: &AgentConfig,
    argv: &[String],
    stdin: Option<&str>,
) -> Result<String, String> {
    let (program, args) = argv.split_first().ok_or_else(|| "empty command".to_string())?;
    let mut command = Command::new(config.queue_command(program));
    command
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = command.spawn().map_err(|e| format!("{program}: {e}"))?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())
            .await
            .map_err(|e| format!("{program}: writing stdin: {e}"))?;
    }
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| format!("{program}: {e}"))?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(format!(
            "{program} exited with {}: {}",
            output.status,
            if stderr.trim().is_empty() { stdout.trim() } else { stderr.trim() }
        ))
    }
}

async fn run_quietly(config: &AgentConfig, argv: &[&str]) -> Option<(bool, String)> {
    let (program, args) = argv.split_first()?;
    let output = Command::new(config.queue_command(program))
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .ok()?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Some((output.status.success(), text))
}

/// Work out which scheduler this host runs.
pub async fn detect(config: &AgentConfig) -> Option<&'static QueueBackend> {
    if let Some((ok, text)) = run_quietly(config, &["qsub", "--version"]).await {
        if text.contains("pbs_version") {
            return Some(&PBSPRO);
        }
        if ok {
            return Some(&TORQUE);
        }
    }
    if let Some((true, _)) = run_quietly(config, &["sbatch", "--version"]).await {
        return Some(&SLURM);
    }
    if let Some((_, text)) = run_quietly(config, &["qstat", "-help"]).await {
        let text = text.trim_start();
        if text.starts_with("SGE") || text.starts_with("GE") {
            return Some(&SGE);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_ids_follow_backend_format() {
        assert_eq!(PBSPRO.parse_submit("1234.pbsserver\n").as_deref(), Some("1234.pbsserver"));
        assert_eq!(SLURM.parse_submit("Submitted batch job 981\n").as_deref(), Some("981"));
        assert_eq!(SGE.parse_submit("4410.1-3:1\n").as_deref(), Some("4410"));
        assert_eq!(SLURM.parse_submit("   "), None);
    }

    #[test]
    fn ids_normalise_to_leading_digits() {
        assert_eq!(normalize_id("123[].server").as_deref(), Some("123"));
        assert_eq!(normalize_id("77-3.torque.host").as_deref(), Some("77"));
        assert_eq!(normalize_id("4410_2").as_deref(), Some("4410"));
        assert_eq!(normalize_id("job-ID"), None);
    }

    #[test]
    fn sge_poll_skips_header_and_collapses_tasks() {
        let output = "job-ID  prior   name  user  state\n\
                      ------------------------------------\n\
                      4410 0.555 profit fit r 1\n\
                      4410 0.555 profit fit r 2\n\
                      4412 0.555 profit fit qw 1\n";
        assert_eq!(SGE.parse_poll(output), vec!["4410", "4412"]);
    }

    #[test]
    fn array_script_selects_job_by_index() {
        let jobs = vec!["/r/Batch-1/a/job_files".to_string(), "/r/Batch-1/b/job_files".to_string()];
        let script = SLURM.render_script(&jobs, &["#SBATCH -p short".to_string()], "/bin/bash");
        assert!(script.starts_with("#!/bin/bash\n#SBATCH --array=1-2\n"));
        assert!(script.contains("#SBATCH -p short\n"));
        assert!(script.contains("JOB_ARRAY[2]='/r/Batch-1/b/job_files'\n"));
        assert!(script.contains("JOB_DIR=\"${JOB_ARRAY[$SLURM_ARRAY_TASK_ID]}\"\n"));
        assert!(script.contains("'/bin/bash' runjob > STDOUT 2> STDERR\n"));
        assert!(script.ends_with("echo $? > STATUS\n"));
    }

    #[test]
    fn single_job_script_has_no_array_line() {
        let script = PBSPRO.render_script(&["/r/j's/job_files".to_string()], &[], "/bin/bash");
        assert!(!script.contains("-J 1-"));
        assert!(script.contains(r"JOB_DIR='/r/j'\''s/job_files'"));
    }

    #[test]
    fn backends_are_found_by_name() {
        assert_eq!(by_name("PBS").map(|b| b.name), Some("pbspro"));
        assert_eq!(by_name("slurm"), Some(&SLURM));
        assert!(by_name("lsf").is_none());
    }
}
