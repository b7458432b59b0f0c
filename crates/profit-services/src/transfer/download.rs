//! Download — walks a remote subtree breadth-first with `LIST` and pulls
//! each file with `DOWNLOAD_FILE`.
//!
//! Frontier state:
//! - `dir_queue`: directories known but not yet listed
//! - `dir_wait`: `LIST` requests in flight
//! - `file_wait`: `DOWNLOAD_FILE` requests in flight
//!
//! The transfer is done when all three are empty.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use profit_core::transfer::{EntryId, EntryKind, TransferRequest, TransferResponse};
use profit_core::wire::codes;

use crate::retry::retry_times;

use super::{DownloadHandler, SkippedEntry, Transfer, TransferError, TransferOptions, TransferPool};

pub(super) fn start<H: DownloadHandler>(
    pool: Arc<TransferPool>,
    options: TransferOptions,
    remote_path: &str,
    handler: H,
) -> Transfer {
    let transfer = Transfer::new();
    let root = remote_path.to_string();
    let handle = transfer.clone();
    tokio::spawn(async move {
        let mut download = Download {
            transaction_id: handle.transaction_id().to_string(),
            pool,
            options,
            handler,
            dir_queue: VecDeque::new(),
            dir_wait: HashSet::new(),
            file_wait: HashSet::new(),
            skipped: Vec::new(),
        };
        let captured = download.run(&handle, root).await;
        handle.complete(&mut download.handler, captured);
    });
    transfer
}

struct Download<H> {
    transaction_id: String,
    pool: Arc<TransferPool>,
    options: TransferOptions,
    handler: H,
    dir_queue: VecDeque<String>,
    dir_wait: HashSet<String>,
    file_wait: HashSet<String>,
    skipped: Vec<SkippedEntry>,
}

impl<H: DownloadHandler> Download<H> {
    async fn run(&mut self, handle: &Transfer, root: String) -> Option<TransferError> {
        let token = handle.token().clone();
        let destination = self.handler.destination().to_path_buf();
        if !tokio::fs::metadata(&destination)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Some(TransferError::MissingDestination(destination));
        }

        let mut sub = match self.pool.subscribe(self.transaction_id.clone()) {
            Ok(sub) => sub,
            Err(e) => return Some(TransferError::Channel(e.to_string())),
        };
        tracing::debug!(transaction_id = %self.transaction_id, path = %root, "download started");

        self.dir_queue.push_back(root);
        if let Err(e) = self.do_next().await {
            return Some(e);
        }
        while !self.is_done() {
            let msg = tokio::select! {
                biased;
                _ = token.cancelled() => return Some(TransferError::DownloadCancelled),
                msg = sub.recv() => msg,
            };
            let Some(msg) = msg else {
                return Some(TransferError::Channel("download channel closed".into()));
            };
            if let Err(e) = self.handle(msg, &token).await {
                return Some(e);
            }
            if let Err(e) = self.do_next().await {
                return Some(e);
            }
        }

        if self.skipped.is_empty() {
            None
        } else {
            Some(TransferError::Skipped(std::mem::take(&mut self.skipped)))
        }
    }

    fn is_done(&self) -> bool {
        self.dir_queue.is_empty() && self.dir_wait.is_empty() && self.file_wait.is_empty()
    }

    /// List the next pending directory, if any.
    async fn do_next(&mut self) -> Result<(), TransferError> {
        if let Some(dir) = self.dir_queue.pop_front() {
            self.dir_wait.insert(dir.clone());
            self.send(TransferRequest::List {
                id: EntryId::new(&self.transaction_id, dir.clone()),
                remote_path: dir,
            })
            .await?;
        }
        Ok(())
    }

    async fn handle(
        &mut self,
        msg: TransferResponse,
        token: &CancellationToken,
    ) -> Result<(), TransferError> {
        match msg {
            TransferResponse::List { id, files } => {
                if !self.dir_wait.contains(&id.path) {
                    tracing::debug!(path = %id.path, "ignoring unexpected listing");
                    return Ok(());
                }
                for entry in files {
                    match entry.kind {
                        EntryKind::File => {
                            self.file_wait.insert(entry.remote_path.clone());
                            self.send(TransferRequest::DownloadFile {
                                id: EntryId::new(&self.transaction_id, entry.remote_path.clone()),
                                remote_path: entry.remote_path,
                            })
                            .await?;
                        }
                        EntryKind::Dir => {
                            let local = self.handler.translate(&entry.remote_path);
                            let made = tokio::select! {
                                biased;
                                _ = token.cancelled() => return Err(TransferError::DownloadCancelled),
                                made = self.handler.mkdir(&local, entry.mode) => made,
                            };
                            made.map_err(|e| TransferError::local(&local, e))?;
                            self.dir_queue.push_back(entry.remote_path);
                        }
                    }
                }
                self.dir_wait.remove(&id.path);
            }
            TransferResponse::DownloadFile {
                id,
                file_data,
                mode,
                ..
            } => {
                if !self.file_wait.contains(&id.path) {
                    tracing::debug!(path = %id.path, "ignoring duplicate file reply");
                    return Ok(());
                }
                let local = self.handler.translate(&id.path);
                let written = tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(TransferError::DownloadCancelled),
                    written = self.handler.write_file(&local, &file_data, mode) => written,
                };
                written.map_err(|e| TransferError::local(&local, e))?;
                self.file_wait.remove(&id.path);
            }
            TransferResponse::Error {
                id,
                reason,
                error_code,
            } => {
                let path = id.map(|id| id.path).unwrap_or_default();
                if error_code.is(codes::LISTDIR) || error_code.is(codes::FILE_OPEN) {
                    tracing::debug!(path = %path, code = %error_code, "skipping unreadable entry");
                    self.dir_wait.remove(&path);
                    self.file_wait.remove(&path);
                    self.skipped.push(SkippedEntry {
                        path,
                        reason,
                        code: error_code,
                    });
                } else {
                    return Err(TransferError::Remote {
                        path,
                        reason,
                        code: error_code,
                    });
                }
            }
            other => tracing::debug!(?other, "ignoring reply not part of a download"),
        }
        Ok(())
    }

    /// Send on the next pool member; a refused send is retried on the
    /// member after it.
    async fn send(&self, msg: TransferRequest) -> Result<(), TransferError> {
        let pool = &self.pool;
        let msg = &msg;
        retry_times(self.options.retries, self.options.retry_pause, move || async move {
            pool.next_channel()?.send(msg)
        })
        .await
        .map_err(|e| TransferError::Channel(e.to_string()))
    }
}
