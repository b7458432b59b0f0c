//! Cleanup agent protocol.

use serde::{Deserialize, Serialize};

use crate::wire::{ErrorCode, MessageSet, Routed};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CleanupRequest {
    Lock { id: String, remote_path: Vec<String> },
    Unlock { id: String, remote_path: Vec<String> },
    Flush { id: String },
}

impl CleanupRequest {
    pub fn id(&self) -> &str {
        match self {
            Self::Lock { id, .. } | Self::Unlock { id, .. } | Self::Flush { id } => id,
        }
    }
}

impl Routed for CleanupRequest {
    fn route(&self) -> Option<&str> {
        Some(self.id())
    }
}

impl MessageSet for CleanupRequest {
    const MESSAGES: &'static [&'static str] = &["LOCK", "UNLOCK", "FLUSH"];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CleanupResponse {
    Locked { channel_id: String, id: String },
    Unlocked { channel_id: String, id: String },
    Flushed { channel_id: String, id: String },
    Error {
        #[serde(default)]
        id: Option<String>,
        reason: String,
        error_code: ErrorCode,
    },
}

impl MessageSet for CleanupResponse {
    const MESSAGES: &'static [&'static str] = &["LOCKED", "UNLOCKED", "FLUSHED", "ERROR"];
}

impl Routed for CleanupResponse {
    fn route(&self) -> Option<&str> {
        match self {
            Self::Locked { id, .. } | Self::Unlocked { id, .. } | Self::Flushed { id, .. } => {
                Some(id)
            }
            Self::Error { id, .. } => id.as_deref(),
        }
    }
}
