//! Transfer agent — serves uploads into, and downloads out of, one root.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::unistd::{access, AccessFlags};

use profit_core::config::AgentConfig;
use profit_core::paths;
use profit_core::transfer::{EntryId, EntryKind, ListEntry, TransferRequest, TransferResponse};
use profit_core::wire::{codes, Code};
use profit_core::StartReply;

use super::{Agent, Outbox, Rejection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Upload,
    Download,
}

pub(crate) struct TransferAgent {
    channel_id: String,
    root: PathBuf,
    direction: Direction,
}

impl TransferAgent {
    pub(crate) async fn upload(
        channel_id: String,
        remote_path: Option<String>,
        config: &AgentConfig,
    ) -> Result<Self, Rejection> {
        let root = resolve_root(remote_path, config).await?;
        if access(root.as_path(), AccessFlags::W_OK).is_err() {
            return Err(Rejection::new(
                codes::PERMISSION_DENIED,
                format!("{} is not writable", root.display()),
            ));
        }
        Ok(Self {
            channel_id,
            root,
            direction: Direction::Upload,
        })
    }

    pub(crate) async fn download(
        channel_id: String,
        remote_path: Option<String>,
        config: &AgentConfig,
    ) -> Result<Self, Rejection> {
        let root = resolve_root(remote_path, config).await?;
        Ok(Self {
            channel_id,
            root,
            direction: Direction::Download,
        })
    }
}

/// Pick the channel root. `None` makes a fresh temporary directory; a
/// missing last component is created when its parent exists.
async fn resolve_root(remote_path: Option<String>, config: &AgentConfig) -> Result<PathBuf, Rejection> {
    let Some(path) = remote_path else {
        let root = config
            .temp_parent()
            .join(format!("profit-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            Rejection::new(codes::MKDIR_FAILED, format!("{}: {e}", root.display()))
        })?;
        return Ok(root);
    };

    let root = paths::normalize(&path);
    match tokio::fs::metadata(&root).await {
        Ok(meta) if meta.is_dir() => Ok(root),
        Ok(_) => Err(Rejection::new(
            codes::REMOTE_IS_NOT_DIRECTORY,
            format!("{} is not a directory", root.display()),
        )),
        Err(_) => {
            let parent_exists = match root.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => tokio::fs::metadata(parent)
                    .await
                    .map(|m| m.is_dir())
                    .unwrap_or(false),
                _ => true,
            };
            if !parent_exists {
                return Err(Rejection::new(
                    codes::REMOTE_DOES_NOT_EXIST,
                    format!("{} does not exist", root.display()),
                ));
            }
            tokio::fs::create_dir(&root).await.map_err(|e| {
                Rejection::new(codes::MKDIR_FAILED, format!("{}: {e}", root.display()))
            })?;
            Ok(root)
        }
    }
}

fn mode_of(meta: &std::fs::Metadata) -> u32 {
    meta.permissions().mode() & 0o7777
}

async fn chmod(path: &Path, mode: u32) -> io::Result<()> {
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

impl TransferAgent {
    fn error(&self, out: &Outbox, id: EntryId, code: Code, reason: String) {
        tracing::debug!(channel_id = %self.channel_id, path = %id.path, %reason, "transfer request failed");
        out.send(&TransferResponse::Error {
            id: Some(id),
            reason,
            error_code: code.into(),
        });
    }

    fn resolve(&self, out: &Outbox, id: &EntryId, remote_path: &str) -> Option<PathBuf> {
        let path = paths::resolve_under(&self.root, remote_path);
        if path.is_none() {
            self.error(
                out,
                id.clone(),
                codes::NOT_CHILD,
                format!("{remote_path} is outside {}", self.root.display()),
            );
        }
        path
    }

    async fn upload_file(&self, out: &Outbox, id: EntryId, remote_path: String, data: Vec<u8>, mode: u32) {
        let Some(path) = self.resolve(out, &id, &remote_path) else {
            return;
        };
        let written = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &data).await?;
            chmod(&path, mode).await
        }
        .await;
        match written {
            Ok(()) => out.send(&TransferResponse::Uploaded { id, remote_path }),
            Err(e) => self.error(out, id, codes::WRITE, format!("{}: {e}", path.display())),
        }
    }

    async fn mkdir(&self, out: &Outbox, id: EntryId, remote_path: String, mode: u32) {
        let Some(path) = self.resolve(out, &id, &remote_path) else {
            return;
        };
        let made = match tokio::fs::create_dir(&path).await {
            Ok(()) => chmod(&path, mode).await,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
            Err(e) => Err(e),
        };
        match made {
            Ok(()) => out.send(&TransferResponse::Mkdir { id, remote_path }),
            Err(e) => self.error(out, id, codes::OSERROR, format!("{}: {e}", path.display())),
        }
    }

    async fn mkdirs(&self, out: &Outbox, id: EntryId, remote_path: String, mode: u32) {
        let Some(path) = self.resolve(out, &id, &remote_path) else {
            return;
        };
        let existed = path.is_dir();
        let made = if existed {
            Ok(())
        } else {
            match tokio::fs::create_dir_all(&path).await {
                Ok(()) => chmod(&path, mode).await,
                Err(e) => Err(e),
            }
        };
        match made {
            Ok(()) => out.send(&TransferResponse::Mkdirs {
                id,
                remote_path,
                path_already_exists: existed,
            }),
            Err(e) => self.error(out, id, codes::OSERROR, format!("{}: {e}", path.display())),
        }
    }

    async fn list(&self, out: &Outbox, id: EntryId, remote_path: String) {
        let Some(path) = self.resolve(out, &id, &remote_path) else {
            return;
        };
        match list_dir(&path, &remote_path).await {
            Ok(files) => out.send(&TransferResponse::List { id, files }),
            Err(e) => self.error(out, id, codes::LISTDIR, format!("{}: {e}", path.display())),
        }
    }

    async fn download_file(&self, out: &Outbox, id: EntryId, remote_path: String) {
        let Some(path) = self.resolve(out, &id, &remote_path) else {
            return;
        };
        if let Err(e) = tokio::fs::symlink_metadata(&path).await {
            if e.kind() == io::ErrorKind::NotFound {
                let reason = format!("{} does not exist", path.display());
                return self.error(out, id, codes::FILE_DOES_NOT_EXIST, reason);
            }
        }
        if path.is_dir() {
            let reason = format!("{} is a directory", path.display());
            return self.error(out, id, codes::IS_DIR, reason);
        }
        let read = async {
            let meta = tokio::fs::metadata(&path).await?;
            let data = tokio::fs::read(&path).await?;
            Ok::<_, io::Error>((data, mode_of(&meta)))
        }
        .await;
        match read {
            Ok((file_data, mode)) => out.send(&TransferResponse::DownloadFile {
                id,
                remote_path,
                file_data,
                mode,
            }),
            Err(e) => self.error(out, id, codes::FILE_OPEN, format!("{}: {e}", path.display())),
        }
    }
}

/// Entries of `path`, named relative to the channel root by prefixing `prefix`.
/// An entry whose target cannot be inspected is listed as a file, so its
/// download reports the failure.
async fn list_dir(path: &Path, prefix: &str) -> io::Result<Vec<ListEntry>> {
    let mut dir = tokio::fs::read_dir(path).await?;
    let mut files = Vec::new();
    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name();
        let remote_path = paths::normalize(Path::new(prefix).join(&name))
            .to_string_lossy()
            .into_owned();
        let (kind, mode) = match tokio::fs::metadata(entry.path()).await {
            Ok(meta) if meta.is_dir() => (EntryKind::Dir, mode_of(&meta)),
            Ok(meta) => (EntryKind::File, mode_of(&meta)),
            Err(e) => {
                tracing::debug!(path = %entry.path().display(), error = %e, "listing uninspectable entry");
                (EntryKind::File, 0o644)
            }
        };
        files.push(ListEntry {
            remote_path,
            kind,
            mode,
        });
    }
    files.sort_by(|a, b| a.remote_path.cmp(&b.remote_path));
    Ok(files)
}

#[async_trait]
impl Agent for TransferAgent {
    type Request = TransferRequest;

    fn ready(&self) -> StartReply {
        StartReply::Ready {
            channel_id: self.channel_id.clone(),
            remote_path: Some(self.root.display().to_string()),
            backend: None,
        }
    }

    async fn handle(&mut self, request: TransferRequest, out: &Outbox) {
        match (self.direction, request) {
            (
                Direction::Upload,
                TransferRequest::Upload {
                    id,
                    remote_path,
                    file_data,
                    mode,
                },
            ) => self.upload_file(out, id, remote_path, file_data, mode).await,
            (
                Direction::Upload,
                TransferRequest::Mkdir {
                    id,
                    remote_path,
                    mode,
                },
            ) => self.mkdir(out, id, remote_path, mode).await,
            (_, TransferRequest::Mkdirs { id, remote_path, mode }) => {
                self.mkdirs(out, id, remote_path, mode).await
            }
            (Direction::Download, TransferRequest::List { id, remote_path }) => {
                self.list(out, id, remote_path).await
            }
            (Direction::Download, TransferRequest::DownloadFile { id, remote_path }) => {
                self.download_file(out, id, remote_path).await
            }
            (direction, other) => {
                let reason = format!("{direction:?} channel cannot serve this request");
                self.error(out, other.id().clone(), codes::UNKNOWN_MSGTYPE, reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("profit-xfer-agent-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn missing_root_is_created_when_parent_exists() {
        let base = scratch("implied");
        let root = base.join("fresh");
        let agent = TransferAgent::upload("u".into(), Some(root.display().to_string()), &AgentConfig::default())
            .await
            .unwrap();
        assert_eq!(agent.root, root);
        assert!(root.is_dir());

        let err = TransferAgent::download(
            "d".into(),
            Some(base.join("a/b/c").display().to_string()),
            &AgentConfig::default(),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.code, codes::REMOTE_DOES_NOT_EXIST);
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn file_as_root_is_rejected() {
        let base = scratch("file-root");
        let file = base.join("plain");
        std::fs::write(&file, b"x").unwrap();
        let err = TransferAgent::download("d".into(), Some(file.display().to_string()), &AgentConfig::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code, codes::REMOTE_IS_NOT_DIRECTORY);
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn listing_names_entries_relative_to_root() {
        let base = scratch("list");
        std::fs::create_dir_all(base.join("job/sub")).unwrap();
        std::fs::write(base.join("job/a.txt"), b"a").unwrap();
        std::fs::set_permissions(base.join("job/a.txt"), std::fs::Permissions::from_mode(0o640)).unwrap();

        let files = list_dir(&base.join("job"), "job").await.unwrap();
        assert_eq!(
            files,
            vec![
                ListEntry {
                    remote_path: "job/a.txt".into(),
                    kind: EntryKind::File,
                    mode: 0o640
                },
                ListEntry {
                    remote_path: "job/sub".into(),
                    kind: EntryKind::Dir,
                    mode: mode_of(&std::fs::metadata(base.join("job/sub")).unwrap())
                },
            ]
        );
        let _ = std::fs::remove_dir_all(&base);
    }
}
