//! Transfer handlers — path translation, destination writes and the final
//! verdict on a captured error.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use profit_core::paths;

use super::TransferError;

/// What the engine does with a captured error after `finish`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishAction {
    Propagate,
    Suppress,
}

pub trait Finish: Send + Sync + 'static {
    /// Called once per transfer. Returning an error replaces the captured one.
    fn finish(&mut self, error: Option<&TransferError>) -> Result<FinishAction, TransferError> {
        let _ = error;
        Ok(FinishAction::Propagate)
    }
}

#[async_trait]
pub trait DownloadHandler: Finish {
    /// Local directory the download lands in. Must exist before the transfer starts.
    fn destination(&self) -> &Path;

    /// Local path for a remote entry.
    fn translate(&self, remote_path: &str) -> PathBuf;

    async fn mkdir(&mut self, path: &Path, mode: u32) -> io::Result<()> {
        match tokio::fs::create_dir(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
    }

    async fn write_file(&mut self, path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
        tokio::fs::write(path, data).await?;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
    }
}

pub trait UploadHandler: Finish {
    /// Local directory being uploaded.
    fn local_root(&self) -> &Path;

    /// Remote path (relative to the pool root) the local root maps to.
    fn remote_root(&self) -> &str;

    /// Remote path for a local entry below `local_root`.
    fn translate(&self, local: &Path) -> Option<String> {
        let rel = local.strip_prefix(self.local_root()).ok()?;
        let joined = Path::new(self.remote_root()).join(rel);
        Some(paths::normalize(joined).to_string_lossy().into_owned())
    }
}

// ── Directory handlers ────────────────────────────────────────────────────────

/// Mirrors a remote subtree into a local directory.
///
/// Skipped entries are logged and suppressed, so a partially readable tree
/// still counts as a successful download.
#[derive(Debug, Clone)]
pub struct DirectoryDownloadHandler {
    source_root: PathBuf,
    destination: PathBuf,
}

impl DirectoryDownloadHandler {
    pub fn new(source_root: impl AsRef<Path>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source_root: paths::normalize(source_root),
            destination: destination.into(),
        }
    }
}

impl Finish for DirectoryDownloadHandler {
    fn finish(&mut self, error: Option<&TransferError>) -> Result<FinishAction, TransferError> {
        match error {
            Some(TransferError::Skipped(entries)) => {
                for entry in entries {
                    tracing::warn!(path = %entry.path, code = %entry.code, reason = %entry.reason, "download skipped entry");
                }
                Ok(FinishAction::Suppress)
            }
            _ => Ok(FinishAction::Propagate),
        }
    }
}

#[async_trait]
impl DownloadHandler for DirectoryDownloadHandler {
    fn destination(&self) -> &Path {
        &self.destination
    }

    fn translate(&self, remote_path: &str) -> PathBuf {
        let remote = paths::normalize(remote_path);
        match remote.strip_prefix(&self.source_root) {
            Ok(rel) => self.destination.join(rel),
            Err(_) => self.destination.join(remote),
        }
    }
}

/// Uploads a local directory to a remote path.
#[derive(Debug, Clone)]
pub struct DirectoryUploadHandler {
    local_root: PathBuf,
    remote_root: String,
}

impl DirectoryUploadHandler {
    pub fn new(local_root: impl Into<PathBuf>, remote_root: impl Into<String>) -> Self {
        Self {
            local_root: local_root.into(),
            remote_root: remote_root.into(),
        }
    }
}

impl Finish for DirectoryUploadHandler {}

impl UploadHandler for DirectoryUploadHandler {
    fn local_root(&self) -> &Path {
        &self.local_root
    }

    fn remote_root(&self) -> &str {
        &self.remote_root
    }
}
