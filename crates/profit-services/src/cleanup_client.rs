//! Cleanup client. Locks, unlocks and flushes paths on a cleanup agent.
//!
//! Each call gets its own `"{base}-{n}"` transaction id and waits on a
//! route for the matching acknowledgement. Calls come in two styles: `lock`
//! and friends await the reply, `lock_then` and friends return at once and
//! hand the outcome to a callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use profit_core::cleanup::{CleanupRequest, CleanupResponse};
use profit_core::{ErrorCode, StartMessage};

use crate::channel::{Channel, ChannelError, ChannelOptions, CleanupProtocol};
use crate::transport::Endpoint;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CleanupError {
    #[error("cleanup agent refused: {reason} ({code})")]
    Remote { reason: String, code: ErrorCode },
    #[error("cleanup channel closed")]
    Closed,
    #[error("no cleanup acknowledgement within {0:?}")]
    Timeout(Duration),
    #[error("cleanup channel failed: {0}")]
    Channel(String),
}

impl From<ChannelError> for CleanupError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Closed => Self::Closed,
            other => Self::Channel(other.to_string()),
        }
    }
}

struct Inner {
    channel: Channel<CleanupProtocol>,
    base: String,
    counter: AtomicU64,
    timeout: Duration,
}

/// Client side of a cleanup channel. Cheap to clone.
///
/// The null client (`CleanupClient::null`) accepts every call and deletes
/// nothing; runners use it when remote cleanup is switched off.
#[derive(Clone)]
pub struct CleanupClient {
    inner: Option<Arc<Inner>>,
}

impl CleanupClient {
    /// Open a cleanup channel rooted at `root`. Closing it removes `root`.
    pub async fn connect(
        endpoint: &Endpoint,
        root: &str,
        options: &ChannelOptions,
        timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let base = uuid::Uuid::new_v4().to_string();
        let start = StartMessage::StartCleanupChannel {
            channel_id: format!("cleanup-{base}"),
            remote_path: root.to_string(),
        };
        let channel = Channel::connect(endpoint, start, options).await?;
        Ok(Self {
            inner: Some(Arc::new(Inner {
                channel,
                base,
                counter: AtomicU64::new(0),
                timeout,
            })),
        })
    }

    pub fn null() -> Self {
        Self { inner: None }
    }

    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    /// Root the agent guards, as the worker resolved it.
    pub fn root(&self) -> Option<&str> {
        self.inner.as_ref().and_then(|i| i.channel.remote_path())
    }

    pub async fn lock(&self, paths: Vec<String>) -> Result<(), CleanupError> {
        self.call(|id| CleanupRequest::Lock {
            id,
            remote_path: paths,
        })
        .await
    }

    pub async fn unlock(&self, paths: Vec<String>) -> Result<(), CleanupError> {
        self.call(|id| CleanupRequest::Unlock {
            id,
            remote_path: paths,
        })
        .await
    }

    /// Delete every unlocked subtree. Returns once the deletions have run.
    pub async fn flush(&self) -> Result<(), CleanupError> {
        self.call(|id| CleanupRequest::Flush { id }).await
    }

    pub fn lock_then<F>(&self, paths: Vec<String>, callback: F)
    where
        F: FnOnce(Result<(), CleanupError>) + Send + 'static,
    {
        let client = self.clone();
        tokio::spawn(async move { callback(client.lock(paths).await) });
    }

    pub fn unlock_then<F>(&self, paths: Vec<String>, callback: F)
    where
        F: FnOnce(Result<(), CleanupError>) + Send + 'static,
    {
        let client = self.clone();
        tokio::spawn(async move { callback(client.unlock(paths).await) });
    }

    pub fn flush_then<F>(&self, callback: F)
    where
        F: FnOnce(Result<(), CleanupError>) + Send + 'static,
    {
        let client = self.clone();
        tokio::spawn(async move { callback(client.flush().await) });
    }

    /// Send the close sentinel. The agent deletes its root before answering.
    pub fn close(&self) {
        if let Some(inner) = &self.inner {
            inner.channel.close();
        }
    }

    pub async fn waitclose(&self, limit: Duration) -> bool {
        match &self.inner {
            Some(inner) => inner.channel.waitclose(limit).await,
            None => true,
        }
    }

    async fn call(&self, build: impl FnOnce(String) -> CleanupRequest) -> Result<(), CleanupError> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        let n = inner.counter.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}-{n}", inner.base);
        let request = build(id.clone());
        let mut sub = inner.channel.request(id.clone(), &request)?;
        let reply = tokio::time::timeout(inner.timeout, sub.recv())
            .await
            .map_err(|_| CleanupError::Timeout(inner.timeout))?;
        match reply {
            Some(CleanupResponse::Error {
                reason, error_code, ..
            }) => {
                tracing::warn!(id, %reason, code = %error_code, "cleanup request refused");
                Err(CleanupError::Remote {
                    reason,
                    code: error_code,
                })
            }
            Some(_) => Ok(()),
            None => Err(CleanupError::Closed),
        }
    }
}
