//! Queueing-system protocol — submit, poll, release and cancel scheduler jobs.

use serde::{Deserialize, Serialize};

use crate::wire::{ErrorCode, MessageSet, Routed};

/// Dispatch key for QSELECT snapshots, solicited or not.
pub const QSELECT_ROUTE: &str = "QSELECT";

/// Default seconds between QSELECT polls.
pub const POLL_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueRequest {
    /// Submit `jobs` (remote job directories) as one held array job.
    Qsub {
        transaction_id: String,
        jobs: Vec<String>,
        #[serde(default)]
        header_lines: Vec<String>,
    },
    Qselect {
        #[serde(default)]
        transaction_id: Option<String>,
    },
    Qrls {
        transaction_id: String,
        job_id: String,
    },
    Qdel {
        transaction_id: String,
        job_ids: Vec<String>,
        #[serde(default)]
        force: bool,
    },
}

impl Routed for QueueRequest {
    fn route(&self) -> Option<&str> {
        match self {
            Self::Qselect { transaction_id } => transaction_id.as_deref(),
            Self::Qsub { transaction_id, .. }
            | Self::Qrls { transaction_id, .. }
            | Self::Qdel { transaction_id, .. } => Some(transaction_id),
        }
    }
}

impl MessageSet for QueueRequest {
    const MESSAGES: &'static [&'static str] = &["QSUB", "QSELECT", "QRLS", "QDEL"];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueResponse {
    Qsub {
        transaction_id: String,
        channel_id: String,
        job_id: String,
    },
    Qselect {
        #[serde(default)]
        transaction_id: Option<String>,
        channel_id: String,
        job_ids: Vec<String>,
    },
    Qrls {
        transaction_id: String,
        job_id: String,
    },
    Qdel {
        transaction_id: String,
        job_ids: Vec<String>,
    },
    Error {
        #[serde(default)]
        transaction_id: Option<String>,
        reason: String,
        error_code: ErrorCode,
    },
}

impl MessageSet for QueueResponse {
    const MESSAGES: &'static [&'static str] = &["QSUB", "QSELECT", "QRLS", "QDEL", "ERROR"];
}

impl Routed for QueueResponse {
    fn route(&self) -> Option<&str> {
        match self {
            Self::Qselect { .. } => Some(QSELECT_ROUTE),
            Self::Qsub { transaction_id, .. }
            | Self::Qrls { transaction_id, .. }
            | Self::Qdel { transaction_id, .. } => Some(transaction_id),
            Self::Error { transaction_id, .. } => transaction_id.as_deref(),
        }
    }
}
