//! Run protocol — single job-process execution on a worker.

use serde::{Deserialize, Serialize};

use crate::wire::{ErrorCode, MessageSet, Routed};

/// Entry point every job directory must contain.
pub const RUNJOB: &str = "runjob";
/// Exit code file written next to the entry point.
pub const STATUS: &str = "STATUS";
pub const STDOUT: &str = "STDOUT";
pub const STDERR: &str = "STDERR";

/// Default shell used to launch `runjob`.
pub const DEFAULT_SHELL: &str = "/bin/bash";
/// Seconds between SIGTERM and SIGKILL.
pub const HARDKILL_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunRequest {
    JobStart { job_id: String, job_path: String },
    JobKill { job_id: String },
}

impl Routed for RunRequest {
    fn route(&self) -> Option<&str> {
        match self {
            Self::JobStart { job_id, .. } | Self::JobKill { job_id } => Some(job_id),
        }
    }
}

impl MessageSet for RunRequest {
    const MESSAGES: &'static [&'static str] = &["JOB_START", "JOB_KILL"];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunResponse {
    JobStart {
        channel_id: String,
        job_id: String,
        pid: u32,
    },
    JobStartError {
        channel_id: String,
        job_id: String,
        reason: String,
    },
    JobEnd {
        channel_id: String,
        job_id: String,
        /// `None` when the process died from a signal.
        returncode: Option<i32>,
        killed: bool,
    },
    Error {
        #[serde(default)]
        job_id: Option<String>,
        reason: String,
        error_code: ErrorCode,
    },
}

impl MessageSet for RunResponse {
    const MESSAGES: &'static [&'static str] = &["JOB_START", "JOB_START_ERROR", "JOB_END", "ERROR"];
}

impl Routed for RunResponse {
    fn route(&self) -> Option<&str> {
        match self {
            Self::JobStart { job_id, .. }
            | Self::JobStartError { job_id, .. }
            | Self::JobEnd { job_id, .. } => Some(job_id),
            Self::Error { job_id, .. } => job_id.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{decode, Inbound};

    #[test]
    fn job_end_carries_signal_death_as_null() {
        let line = r#"{"msg":"JOB_END","channel_id":"run_0","job_id":"j-1","returncode":null,"killed":true}"#;
        let Inbound::Message(msg) = decode::<RunResponse>(line).unwrap() else {
            panic!("expected message");
        };
        assert_eq!(msg.route(), Some("j-1"));
        assert!(matches!(msg, RunResponse::JobEnd { returncode: None, killed: true, .. }));
    }
}
