//! MultiChannel — a fixed pool of identically-started channels sharing one
//! dispatch table, used for parallel in-flight transfers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use profit_core::StartMessage;

use crate::channel::{Channel, ChannelError, ChannelOptions, Protocol};
use crate::dispatch::{Routes, Subscription};
use crate::transport::Endpoint;

pub struct MultiChannel<P: Protocol> {
    members: Vec<Arc<Channel<P>>>,
    routes: Routes<P::Response>,
    cursor: AtomicUsize,
}

impl<P: Protocol> MultiChannel<P> {
    /// Start `size` members with ids `{base}_0 .. {base}_{size-1}`.
    ///
    /// Member 0 connects first. When it reports a resolved root (a fresh
    /// temporary directory, say) the remaining members are pinned to it so
    /// the whole pool agrees on one root.
    pub async fn connect(
        endpoint: &Endpoint,
        start: StartMessage,
        size: usize,
        options: &ChannelOptions,
    ) -> Result<Self, ChannelError> {
        let size = size.max(1);
        let base = start.channel_id().to_string();
        let routes = Routes::new();

        let first = Channel::connect_with_routes(
            endpoint,
            start.with_channel_id(format!("{base}_0")),
            options,
            routes.clone(),
        )
        .await?;
        let start = match first.remote_path() {
            Some(root) => start.with_remote_path(root),
            None => start,
        };

        let rest = futures::future::try_join_all((1..size).map(|i| {
            Channel::connect_with_routes(
                endpoint,
                start.with_channel_id(format!("{base}_{i}")),
                options,
                routes.clone(),
            )
        }))
        .await;
        let rest = match rest {
            Ok(rest) => rest,
            Err(e) => {
                first.close();
                return Err(e);
            }
        };

        let members: Vec<Arc<Channel<P>>> = std::iter::once(first)
            .chain(rest)
            .map(Arc::new)
            .collect();
        tracing::debug!(base, size, "channel pool started");
        Ok(Self {
            members,
            routes,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Root every member agreed on, if the protocol has one.
    pub fn remote_path(&self) -> Option<&str> {
        self.members.first().and_then(|c| c.remote_path())
    }

    pub fn routes(&self) -> &Routes<P::Response> {
        &self.routes
    }

    /// Round-robin over open members for outbound requests. A member that
    /// has gone down is skipped; `Closed` once none is left.
    pub fn next_channel(&self) -> Result<Arc<Channel<P>>, ChannelError> {
        let n = self.members.len();
        for _ in 0..n {
            let i = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
            if self.members[i].is_open() {
                return Ok(self.members[i].clone());
            }
        }
        Err(ChannelError::Closed)
    }

    /// Members still open.
    pub fn live(&self) -> usize {
        self.members.iter().filter(|m| m.is_open()).count()
    }

    pub fn channel(&self, channel_id: &str) -> Option<Arc<Channel<P>>> {
        self.members
            .iter()
            .find(|c| c.channel_id() == channel_id)
            .cloned()
    }

    pub fn members(&self) -> &[Arc<Channel<P>>] {
        &self.members
    }

    /// Claim a transaction id in the shared table.
    pub fn subscribe(&self, key: impl Into<String>) -> Result<Subscription<P::Response>, ChannelError> {
        self.routes.register(key)
    }

    /// Send to the next member in rotation.
    pub fn send(&self, msg: &P::Request) -> Result<(), ChannelError> {
        self.next_channel()?.send(msg)
    }

    pub fn close(&self) {
        for member in &self.members {
            member.close();
        }
    }

    /// Wait for every member to acknowledge its close. `false` when any
    /// member had to be torn down forcefully.
    pub async fn waitclose(&self, limit: Duration) -> bool {
        let results =
            futures::future::join_all(self.members.iter().map(|m| m.waitclose(limit))).await;
        results.into_iter().all(|ok| ok)
    }
}
