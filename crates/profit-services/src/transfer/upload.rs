//! Upload — creates the remote root with `MKDIRS`, then walks the local tree
//! one depth level at a time: `MKDIR` every directory and `UPLOAD` every
//! file of a level, and wait for all of that level's replies before moving
//! deeper, so parents always exist before their children arrive.

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use profit_core::transfer::{EntryId, TransferRequest, TransferResponse};
use profit_core::wire::codes;

use crate::dispatch::Subscription;
use crate::retry::retry_times;

use super::{SkippedEntry, Transfer, TransferError, TransferOptions, TransferPool, UploadHandler};

pub(super) fn start<H: UploadHandler>(
    pool: Arc<TransferPool>,
    options: TransferOptions,
    handler: H,
) -> Transfer {
    let transfer = Transfer::new();
    let handle = transfer.clone();
    tokio::spawn(async move {
        let mut upload = Upload {
            transaction_id: handle.transaction_id().to_string(),
            pool,
            options,
            handler,
            pending: HashSet::new(),
            skipped: Vec::new(),
        };
        let token = handle.token().clone();
        let captured = upload.run(&token).await.err();
        handle.complete(&mut upload.handler, captured);
    });
    transfer
}

/// Create `remote_path` and its parents. Returns whether it already existed.
pub(super) async fn mkdirs(
    pool: &TransferPool,
    options: &TransferOptions,
    remote_path: &str,
    mode: u32,
) -> Result<bool, TransferError> {
    let transaction_id = uuid::Uuid::new_v4().to_string();
    let msg = TransferRequest::Mkdirs {
        id: EntryId::new(&transaction_id, remote_path),
        remote_path: remote_path.to_string(),
        mode,
    };
    let mut sub = pool
        .subscribe(transaction_id)
        .map_err(|e| TransferError::Channel(e.to_string()))?;
    let msg = &msg;
    retry_times(options.retries, options.retry_pause, move || async move {
        pool.next_channel()?.send(msg)
    })
    .await
    .map_err(|e| TransferError::Channel(e.to_string()))?;
    match sub.recv().await {
        Some(TransferResponse::Mkdirs {
            path_already_exists,
            ..
        }) => Ok(path_already_exists),
        Some(TransferResponse::Error {
            reason, error_code, ..
        }) => Err(TransferError::Remote {
            path: remote_path.to_string(),
            reason,
            code: error_code,
        }),
        Some(other) => Err(TransferError::Channel(format!("unexpected reply {other:?}"))),
        None => Err(TransferError::Channel("upload channel closed".into())),
    }
}

#[derive(Debug)]
struct LocalEntry {
    path: PathBuf,
    is_dir: bool,
    mode: u32,
}

/// Entries below `root` grouped by depth, shallowest first.
fn walk_levels(root: &Path) -> (Vec<Vec<LocalEntry>>, Vec<SkippedEntry>) {
    let mut levels: Vec<Vec<LocalEntry>> = Vec::new();
    let mut skipped = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                skipped.push(SkippedEntry {
                    path: e.path().map(|p| p.display().to_string()).unwrap_or_default(),
                    reason: e.to_string(),
                    code: codes::LISTDIR.into(),
                });
                continue;
            }
        };
        let mode = match entry.metadata() {
            Ok(meta) => meta.permissions().mode() & 0o7777,
            Err(e) => {
                skipped.push(SkippedEntry {
                    path: entry.path().display().to_string(),
                    reason: e.to_string(),
                    code: codes::FILE_OPEN.into(),
                });
                continue;
            }
        };
        let depth = entry.depth();
        if levels.len() < depth {
            levels.resize_with(depth, Vec::new);
        }
        levels[depth - 1].push(LocalEntry {
            is_dir: entry.file_type().is_dir(),
            path: entry.into_path(),
            mode,
        });
    }
    (levels, skipped)
}

struct Upload<H> {
    transaction_id: String,
    pool: Arc<TransferPool>,
    options: TransferOptions,
    handler: H,
    pending: HashSet<String>,
    skipped: Vec<SkippedEntry>,
}

impl<H: UploadHandler> Upload<H> {
    async fn run(&mut self, token: &CancellationToken) -> Result<(), TransferError> {
        let root = self.handler.local_root().to_path_buf();
        let meta = tokio::fs::metadata(&root)
            .await
            .map_err(|e| TransferError::local(&root, e))?;
        if !meta.is_dir() {
            return Err(TransferError::local(
                &root,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "upload source is not a directory"),
            ));
        }

        let mut sub = self
            .pool
            .subscribe(self.transaction_id.clone())
            .map_err(|e| TransferError::Channel(e.to_string()))?;
        let remote_root = self.handler.remote_root().to_string();
        tracing::debug!(transaction_id = %self.transaction_id, path = %remote_root, "upload started");

        self.request(TransferRequest::Mkdirs {
            id: EntryId::new(&self.transaction_id, remote_root.clone()),
            remote_path: remote_root,
            mode: meta.permissions().mode() & 0o7777,
        })
        .await?;
        self.drain(&mut sub, token).await?;

        let walk_root = root.clone();
        let (levels, skipped) = tokio::task::spawn_blocking(move || walk_levels(&walk_root))
            .await
            .map_err(|e| TransferError::local(&root, std::io::Error::other(e)))?;
        self.skipped.extend(skipped);

        for level in levels {
            for entry in level {
                let Some(remote) = self.handler.translate(&entry.path) else {
                    continue;
                };
                let id = EntryId::new(&self.transaction_id, remote.clone());
                if entry.is_dir {
                    self.request(TransferRequest::Mkdir {
                        id,
                        remote_path: remote,
                        mode: entry.mode,
                    })
                    .await?;
                    continue;
                }
                let data = tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(TransferError::UploadCancelled),
                    data = tokio::fs::read(&entry.path) => data,
                };
                match data {
                    Ok(file_data) => {
                        self.request(TransferRequest::Upload {
                            id,
                            remote_path: remote,
                            file_data,
                            mode: entry.mode,
                        })
                        .await?
                    }
                    Err(e) => self.skipped.push(SkippedEntry {
                        path: entry.path.display().to_string(),
                        reason: e.to_string(),
                        code: codes::FILE_OPEN.into(),
                    }),
                }
            }
            self.drain(&mut sub, token).await?;
        }

        if self.skipped.is_empty() {
            Ok(())
        } else {
            Err(TransferError::Skipped(std::mem::take(&mut self.skipped)))
        }
    }

    /// Wait until every request of the current level has been answered.
    async fn drain(
        &mut self,
        sub: &mut Subscription<TransferResponse>,
        token: &CancellationToken,
    ) -> Result<(), TransferError> {
        while !self.pending.is_empty() {
            let msg = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(TransferError::UploadCancelled),
                msg = sub.recv() => msg,
            };
            match msg {
                None => return Err(TransferError::Channel("upload channel closed".into())),
                Some(TransferResponse::Uploaded { id, .. })
                | Some(TransferResponse::Mkdir { id, .. })
                | Some(TransferResponse::Mkdirs { id, .. }) => {
                    self.pending.remove(&id.path);
                }
                Some(TransferResponse::Error {
                    id,
                    reason,
                    error_code,
                }) => {
                    return Err(TransferError::Remote {
                        path: id.map(|id| id.path).unwrap_or_default(),
                        reason,
                        code: error_code,
                    })
                }
                Some(other) => tracing::debug!(?other, "ignoring reply not part of an upload"),
            }
        }
        Ok(())
    }

    async fn request(&mut self, msg: TransferRequest) -> Result<(), TransferError> {
        self.pending.insert(msg.id().path.clone());
        let pool = &self.pool;
        let msg = &msg;
        retry_times(self.options.retries, self.options.retry_pause, move || async move {
            pool.next_channel()?.send(msg)
        })
        .await
        .map_err(|e| TransferError::Channel(e.to_string()))
    }
}
