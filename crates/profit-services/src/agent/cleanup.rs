//! Cleanup agent — reference state in a [`LockTree`], deletions on a
//! dedicated task so protocol handling never waits on the filesystem.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use profit_core::cleanup::{CleanupRequest, CleanupResponse};
use profit_core::wire::codes;
use profit_core::{LockTree, StartReply};

use super::{Agent, Outbox, Rejection};

enum Deletion {
    Remove(PathBuf),
    /// Sent once every deletion queued before it has run.
    Ack(CleanupResponse),
}

pub(crate) struct CleanupAgent {
    channel_id: String,
    tree: LockTree,
    deleter: Option<(mpsc::UnboundedSender<Deletion>, JoinHandle<()>)>,
}

impl CleanupAgent {
    pub(crate) async fn start(channel_id: String, remote_path: String) -> Result<Self, Rejection> {
        let root = PathBuf::from(&remote_path);
        match tokio::fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(Rejection::new(
                    codes::REMOTE_IS_NOT_DIRECTORY,
                    format!("{remote_path} is not a directory"),
                ))
            }
            Err(_) => {
                return Err(Rejection::new(
                    codes::FILE_DOES_NOT_EXIST,
                    format!("{remote_path} does not exist"),
                ))
            }
        }
        Ok(Self {
            channel_id,
            tree: LockTree::new(root),
            deleter: None,
        })
    }

    fn enqueue(&self, deletion: Deletion) {
        if let Some((tx, _)) = &self.deleter {
            let _ = tx.send(deletion);
        }
    }
}

async fn run_deleter(mut rx: mpsc::UnboundedReceiver<Deletion>, out: Outbox) {
    while let Some(deletion) = rx.recv().await {
        match deletion {
            Deletion::Remove(path) => remove_tree(&path).await,
            Deletion::Ack(reply) => out.send(&reply),
        }
    }
}

/// Remove a file or directory tree. Already-gone paths count as clean.
async fn remove_tree(path: &std::path::Path) {
    let removed = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match removed {
        Ok(()) => tracing::debug!(path = %path.display(), "deleted"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "deletion failed, treating as clean"),
    }
}

#[async_trait]
impl Agent for CleanupAgent {
    type Request = CleanupRequest;

    fn ready(&self) -> StartReply {
        StartReply::Ready {
            channel_id: self.channel_id.clone(),
            remote_path: Some(self.tree.root().display().to_string()),
            backend: None,
        }
    }

    fn started(&mut self, out: &Outbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_deleter(rx, out.clone()));
        self.deleter = Some((tx, task));
    }

    async fn handle(&mut self, request: CleanupRequest, out: &Outbox) {
        let channel_id = self.channel_id.clone();
        match request {
            CleanupRequest::Lock { id, remote_path } => {
                if let Err(e) = self.tree.lock_all(&remote_path) {
                    return out.send(&CleanupResponse::Error {
                        id: Some(id),
                        reason: e.to_string(),
                        error_code: e.code().into(),
                    });
                }
                tracing::debug!(channel_id, id, paths = ?remote_path, "locked");
                out.send(&CleanupResponse::Locked { channel_id, id });
            }
            CleanupRequest::Unlock { id, remote_path } => {
                if let Err(e) = self.tree.unlock_all(&remote_path) {
                    return out.send(&CleanupResponse::Error {
                        id: Some(id),
                        reason: e.to_string(),
                        error_code: e.code().into(),
                    });
                }
                tracing::debug!(channel_id, id, paths = ?remote_path, "unlocked");
                out.send(&CleanupResponse::Unlocked { channel_id, id });
            }
            CleanupRequest::Flush { id } => {
                let doomed = self.tree.flush();
                tracing::debug!(channel_id, id, count = doomed.len(), "flushing");
                for path in doomed {
                    self.enqueue(Deletion::Remove(path));
                }
                self.enqueue(Deletion::Ack(CleanupResponse::Flushed { channel_id, id }));
            }
        }
    }

    async fn shutdown(&mut self, _out: &Outbox) {
        let root = self.tree.root().to_path_buf();
        if let Some((tx, task)) = self.deleter.take() {
            let _ = tx.send(Deletion::Remove(root.clone()));
            drop(tx);
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "deleter task failed");
            }
        } else {
            remove_tree(&root).await;
        }
        tracing::info!(root = %root.display(), "cleanup root removed");
    }
}
