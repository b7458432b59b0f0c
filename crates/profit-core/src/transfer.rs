//! Directory transfer protocol — upload and download message sets.
//!
//! Requests are issued per entry and correlated by [`EntryId`]; remote
//! paths are relative to the channel root negotiated in the handshake.

use serde::{Deserialize, Serialize};

use crate::wire::{base64_data, ErrorCode, MessageSet, Routed};

/// Transaction id plus the path the request concerns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryId {
    pub transaction_id: String,
    pub path: String,
}

impl EntryId {
    pub fn new(transaction_id: &str, path: impl Into<String>) -> Self {
        Self {
            transaction_id: transaction_id.to_string(),
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

/// One entry of a `LIST` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    pub remote_path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Permission bits.
    pub mode: u32,
}

/// Client → worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferRequest {
    Upload {
        id: EntryId,
        remote_path: String,
        #[serde(with = "base64_data")]
        file_data: Vec<u8>,
        mode: u32,
    },
    Mkdir {
        id: EntryId,
        remote_path: String,
        mode: u32,
    },
    /// Like `MKDIR` but creates every missing ancestor.
    Mkdirs {
        id: EntryId,
        remote_path: String,
        mode: u32,
    },
    List {
        id: EntryId,
        remote_path: String,
    },
    DownloadFile {
        id: EntryId,
        remote_path: String,
    },
}

impl TransferRequest {
    pub fn id(&self) -> &EntryId {
        match self {
            Self::Upload { id, .. }
            | Self::Mkdir { id, .. }
            | Self::Mkdirs { id, .. }
            | Self::List { id, .. }
            | Self::DownloadFile { id, .. } => id,
        }
    }
}

impl Routed for TransferRequest {
    fn route(&self) -> Option<&str> {
        Some(&self.id().transaction_id)
    }
}

impl MessageSet for TransferRequest {
    const MESSAGES: &'static [&'static str] = &["UPLOAD", "MKDIR", "MKDIRS", "LIST", "DOWNLOAD_FILE"];
}

/// Worker → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferResponse {
    Uploaded {
        id: EntryId,
        remote_path: String,
    },
    Mkdir {
        id: EntryId,
        remote_path: String,
    },
    Mkdirs {
        id: EntryId,
        remote_path: String,
        path_already_exists: bool,
    },
    List {
        id: EntryId,
        files: Vec<ListEntry>,
    },
    DownloadFile {
        id: EntryId,
        remote_path: String,
        #[serde(with = "base64_data")]
        file_data: Vec<u8>,
        mode: u32,
    },
    Error {
        #[serde(default)]
        id: Option<EntryId>,
        reason: String,
        error_code: ErrorCode,
    },
}

impl TransferResponse {
    pub fn id(&self) -> Option<&EntryId> {
        match self {
            Self::Uploaded { id, .. }
            | Self::Mkdir { id, .. }
            | Self::Mkdirs { id, .. }
            | Self::List { id, .. }
            | Self::DownloadFile { id, .. } => Some(id),
            Self::Error { id, .. } => id.as_ref(),
        }
    }
}

impl MessageSet for TransferResponse {
    const MESSAGES: &'static [&'static str] =
        &["UPLOADED", "MKDIR", "MKDIRS", "LIST", "DOWNLOAD_FILE", "ERROR"];
}

impl Routed for TransferResponse {
    fn route(&self) -> Option<&str> {
        self.id().map(|id| id.transaction_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{codes, decode, encode, Inbound};

    #[test]
    fn file_data_is_base64_on_the_wire() {
        let msg = TransferRequest::Upload {
            id: EntryId::new("t1", "a/b"),
            remote_path: "a/b".into(),
            file_data: b"hello".to_vec(),
            mode: 0o644,
        };
        let text = String::from_utf8(encode(&msg).unwrap()).unwrap();
        assert!(text.contains(r#""msg":"UPLOAD""#));
        assert!(text.contains(r#""file_data":"aGVsbG8=""#));
        assert_eq!(decode::<TransferRequest>(&text).unwrap(), Inbound::Message(msg));
    }

    #[test]
    fn list_entries_use_type_key() {
        let line = r#"{"msg":"LIST","id":{"transaction_id":"t","path":"."},
            "files":[{"remote_path":"x","type":"dir","mode":493}]}"#
            .replace('\n', "");
        let Inbound::Message(TransferResponse::List { files, .. }) =
            decode::<TransferResponse>(&line).unwrap()
        else {
            panic!("expected LIST");
        };
        assert_eq!(files[0].kind, EntryKind::Dir);
        assert_eq!(files[0].mode, 0o755);
    }

    #[test]
    fn errors_route_by_transaction_when_id_known() {
        let err = TransferResponse::Error {
            id: Some(EntryId::new("t9", "sub")),
            reason: "denied".into(),
            error_code: codes::LISTDIR.into(),
        };
        assert_eq!(err.route(), Some("t9"));

        let anonymous = TransferResponse::Error {
            id: None,
            reason: "bad".into(),
            error_code: codes::KEY_ERROR.into(),
        };
        assert_eq!(anonymous.route(), None);
    }
}
