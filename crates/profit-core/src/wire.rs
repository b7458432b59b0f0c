//! profit wire format — framing shared by every channel protocol.
//!
//! A frame is one JSON value terminated by `\n`. Message frames are objects
//! carrying a `msg` discriminator; the literal `null` is the close sentinel.
//! Each protocol (transfer, cleanup, run, queue) defines its own closed
//! message set in a sibling module. The first frame on every channel is a
//! [`StartMessage`], answered by a [`StartReply`].

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Seconds to wait for `READY` after sending a start message.
pub const CONNECT_TIMEOUT_SECS: u64 = 60;

/// Default keep-alive cadence. 0 disables keep-alive.
pub const KEEP_ALIVE_SECS: u64 = 10;

/// Discriminator key present in every message object.
pub const MSG_KEY: &str = "msg";

/// Discriminator of the keep-alive frame understood by every protocol.
pub const KEEP_ALIVE: &str = "KEEP_ALIVE";

/// Close sentinel, already framed.
pub const CLOSE_FRAME: &[u8] = b"null\n";

// ── Error codes ───────────────────────────────────────────────────────────────

/// `(CATEGORY, SPECIFIC)` pair carried by `ERROR` replies.
///
/// Callers match on this rather than on the human-readable `reason`.
/// Serialised as a two-element JSON array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorCode(pub String, pub String);

/// Static form of an [`ErrorCode`], used for the well-known codes.
pub type Code = (&'static str, &'static str);

impl ErrorCode {
    pub fn new(category: &str, specific: &str) -> Self {
        Self(category.to_string(), specific.to_string())
    }

    pub fn is(&self, code: Code) -> bool {
        self.0 == code.0 && self.1 == code.1
    }
}

impl From<Code> for ErrorCode {
    fn from(code: Code) -> Self {
        Self::new(code.0, code.1)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.0, self.1)
    }
}

/// Well-known error codes.
pub mod codes {
    use super::Code;

    pub const PERMISSION_DENIED: Code = ("IOERROR", "PERMISSION_DENIED");
    pub const REMOTE_DOES_NOT_EXIST: Code = ("IOERROR", "REMOTE_DOES_NOT_EXIST");
    pub const REMOTE_IS_NOT_DIRECTORY: Code = ("IOERROR", "REMOTE_IS_NOT_DIRECTORY");
    pub const MKDIR_FAILED: Code = ("IOERROR", "MKDIR_FAILED");
    pub const WRITE: Code = ("IOERROR", "WRITE");
    pub const OSERROR: Code = ("IOERROR", "OSERROR");
    pub const FILE_DOES_NOT_EXIST: Code = ("IOERROR", "FILEDOESNOTEXIST");
    pub const IS_DIR: Code = ("IOERROR", "ISDIR");
    pub const FILE_OPEN: Code = ("IOERROR", "FILEOPEN");
    pub const LISTDIR: Code = ("OSERROR", "LISTDIR");
    pub const NOT_CHILD: Code = ("PATHERROR", "NOTCHILD");
    pub const NOT_REGISTERED: Code = ("PATHERROR", "NOT_REGISTERED");
    pub const UNKNOWN_MSGTYPE: Code = ("MSGERROR", "UNKNOWN_MSGTYPE");
    pub const KEY_ERROR: Code = ("MSGERROR", "KEYERROR");
    pub const JOB_START: Code = ("JOBERROR", "START");
    pub const QUEUE_COMMAND: Code = ("QUEUEERROR", "COMMAND");
}

// ── Message sets ──────────────────────────────────────────────────────────────

/// A closed set of protocol messages sharing one `msg` namespace.
pub trait MessageSet: Serialize + DeserializeOwned + Send + 'static {
    /// Every `msg` value this set accepts.
    const MESSAGES: &'static [&'static str];
}

/// Inbound messages that can be routed to a pending transaction.
pub trait Routed {
    /// Dispatch key, or `None` when the message names no transaction.
    fn route(&self) -> Option<&str>;
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// First frame written by the client on a fresh channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartMessage {
    StartUploadChannel {
        channel_id: String,
        /// `None` asks the worker for a fresh temporary directory.
        #[serde(default)]
        remote_path: Option<String>,
    },
    StartDownloadChannel {
        channel_id: String,
        #[serde(default)]
        remote_path: Option<String>,
    },
    StartCleanupChannel {
        channel_id: String,
        remote_path: String,
    },
    /// Run protocol.
    StartChannel {
        channel_id: String,
        shell: String,
        hardkill_timeout: u64,
        /// Concurrent job slots. 0 = available parallelism.
        #[serde(default)]
        max_jobs: u32,
    },
    StartQueueingChannel {
        channel_id: String,
        /// Backend name. `None` = detect on the worker.
        #[serde(default)]
        backend: Option<String>,
        /// Seconds between unsolicited QSELECT broadcasts. `None` = only on request.
        #[serde(default)]
        poll_interval: Option<u64>,
    },
}

impl StartMessage {
    pub fn channel_id(&self) -> &str {
        match self {
            Self::StartUploadChannel { channel_id, .. }
            | Self::StartDownloadChannel { channel_id, .. }
            | Self::StartCleanupChannel { channel_id, .. }
            | Self::StartChannel { channel_id, .. }
            | Self::StartQueueingChannel { channel_id, .. } => channel_id,
        }
    }

    /// Same start parameters under another channel id.
    pub fn with_channel_id(&self, id: impl Into<String>) -> Self {
        let mut msg = self.clone();
        match &mut msg {
            Self::StartUploadChannel { channel_id, .. }
            | Self::StartDownloadChannel { channel_id, .. }
            | Self::StartCleanupChannel { channel_id, .. }
            | Self::StartChannel { channel_id, .. }
            | Self::StartQueueingChannel { channel_id, .. } => *channel_id = id.into(),
        }
        msg
    }

    /// Pin a transfer or cleanup start to an already-resolved root.
    pub fn with_remote_path(&self, path: impl Into<String>) -> Self {
        let mut msg = self.clone();
        match &mut msg {
            Self::StartUploadChannel { remote_path, .. }
            | Self::StartDownloadChannel { remote_path, .. } => *remote_path = Some(path.into()),
            Self::StartCleanupChannel { remote_path, .. } => *remote_path = path.into(),
            Self::StartChannel { .. } | Self::StartQueueingChannel { .. } => {}
        }
        msg
    }
}

/// Worker's answer to a [`StartMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartReply {
    Ready {
        channel_id: String,
        /// Resolved root for transfer and cleanup channels.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remote_path: Option<String>,
        /// Resolved scheduler for queueing channels.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backend: Option<String>,
    },
    Error {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<ErrorCode>,
    },
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// One decoded inbound frame.
#[derive(Debug, PartialEq)]
pub enum Inbound<M> {
    Message(M),
    KeepAlive,
    Close,
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("frame has no `msg` discriminator")]
    MissingDiscriminator,
    #[error("unknown message type {0:?}")]
    UnknownMessage(String),
    #[error("invalid {msg} message: {source}")]
    InvalidFields {
        msg: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}

impl WireError {
    /// Error code reported back to the peer for this decode failure.
    pub fn code(&self) -> Code {
        match self {
            Self::UnknownMessage(_) => codes::UNKNOWN_MSGTYPE,
            _ => codes::KEY_ERROR,
        }
    }
}

/// Serialise one message into a newline-terminated frame.
pub fn encode<M: Serialize>(msg: &M) -> Result<Vec<u8>, WireError> {
    let mut buf = serde_json::to_vec(msg).map_err(WireError::Encode)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Keep-alive frame.
pub fn keep_alive_frame() -> Vec<u8> {
    format!("{{\"{MSG_KEY}\":\"{KEEP_ALIVE}\"}}\n").into_bytes()
}

/// Decode one line of input against the message set `M`.
pub fn decode<M: MessageSet>(line: &str) -> Result<Inbound<M>, WireError> {
    let value: serde_json::Value =
        serde_json::from_str(line.trim()).map_err(WireError::Malformed)?;
    if value.is_null() {
        return Ok(Inbound::Close);
    }
    let msg = value
        .get(MSG_KEY)
        .and_then(|m| m.as_str())
        .ok_or(WireError::MissingDiscriminator)?
        .to_string();
    if msg == KEEP_ALIVE {
        return Ok(Inbound::KeepAlive);
    }
    if !M::MESSAGES.contains(&msg.as_str()) {
        return Err(WireError::UnknownMessage(msg));
    }
    serde_json::from_value(value)
        .map(Inbound::Message)
        .map_err(|source| WireError::InvalidFields { msg, source })
}

/// Decode the handshake frame. The close sentinel is not valid here.
pub fn decode_start<T: DeserializeOwned>(line: &str) -> Result<T, WireError> {
    let value: serde_json::Value =
        serde_json::from_str(line.trim()).map_err(WireError::Malformed)?;
    let msg = value
        .get(MSG_KEY)
        .and_then(|m| m.as_str())
        .ok_or(WireError::MissingDiscriminator)?
        .to_string();
    serde_json::from_value(value).map_err(|source| WireError::InvalidFields { msg, source })
}

/// `file_data` fields travel as base64 strings.
pub mod base64_data {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
