//! Queueing-system client.
//!
//! Jobs go to the scheduler held. A submitted job is released only once a
//! `QSELECT` snapshot shows it, and it counts as finished when a later
//! snapshot no longer does. The scheduler never reports completion itself,
//! so the poll interval bounds how quickly a finished job is noticed.

mod client;
mod state;

use std::time::Duration;

use profit_core::config::{ProfitConfig, QueueConfig};
use profit_core::ErrorCode;

pub use client::{QueueClient, QueueJob};
pub use state::{diff, Membership, QueueState};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("scheduler refused the request: {reason} ({code})")]
    Scheduler { reason: String, code: ErrorCode },
    #[error("queued job killed")]
    Killed,
    #[error("queue channel closed")]
    ChannelClosed,
    #[error("queued job already finished")]
    JobAlreadyFinished,
    #[error("queue protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Scheduler name; `None` lets the worker detect it.
    pub backend: Option<String>,
    pub poll_interval: Duration,
    /// Bound on waiting for a scheduler id or a `QDEL` acknowledgement.
    pub kill_timeout: Duration,
    /// Extra directives added to every submitted script.
    pub header_lines: Vec<String>,
}

impl QueueSettings {
    pub fn from_config(config: &ProfitConfig, backend: Option<String>) -> Self {
        let QueueConfig {
            backend: configured,
            poll_interval_secs,
        } = &config.queue;
        Self {
            backend: backend.or_else(|| configured.clone()),
            poll_interval: Duration::from_secs(*poll_interval_secs),
            kill_timeout: config.transport.kill_timeout(),
            header_lines: config.runner.header_lines.clone(),
        }
    }
}
