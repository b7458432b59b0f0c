//! Dispatch table — routes inbound replies to the single handler pending
//! on their transaction id.
//!
//! One table belongs to one channel, or is shared by every member of a
//! [`MultiChannel`](crate::multichannel::MultiChannel) pool, so the
//! effective key is (channel or pool, transaction id).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;

use profit_core::Routed;

use crate::channel::ChannelError;

pub struct Routes<M> {
    inner: Arc<RoutesInner<M>>,
}

struct RoutesInner<M> {
    table: DashMap<String, mpsc::UnboundedSender<M>>,
    closed: AtomicBool,
    /// Live [`Lease`]s. The table closes when the last one is released.
    holders: AtomicUsize,
}

impl<M> Clone for Routes<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M> Default for Routes<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Routes<M> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RoutesInner {
                table: DashMap::new(),
                closed: AtomicBool::new(false),
                holders: AtomicUsize::new(0),
            }),
        }
    }

    /// Claim `key`. Replies routed to it arrive on the returned subscription
    /// until the subscription is dropped.
    pub fn register(&self, key: impl Into<String>) -> Result<Subscription<M>, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let key = key.into();
        let (tx, rx) = mpsc::unbounded_channel();
        match self.inner.table.entry(key.clone()) {
            Entry::Occupied(_) => return Err(ChannelError::DuplicateRoute(key)),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        // A close racing with the insert above must not leave a live route behind.
        if self.is_closed() {
            self.inner.table.remove(&key);
            return Err(ChannelError::Closed);
        }
        Ok(Subscription {
            key,
            rx,
            routes: self.clone(),
        })
    }

    /// Take a hold on the table for one channel.
    pub fn lease(&self) -> Lease<M> {
        self.inner.holders.fetch_add(1, Ordering::SeqCst);
        Lease {
            routes: self.clone(),
            released: AtomicBool::new(false),
        }
    }

    /// End the route for `key` without closing the table. Its subscription
    /// observes end-of-stream.
    pub fn fail(&self, key: &str) {
        self.inner.table.remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.table.contains_key(key)
    }

    /// Drop every route. Pending subscriptions observe end-of-stream.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.table.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.table.is_empty()
    }
}

impl<M: Routed> Routes<M> {
    /// Hand `msg` to its pending handler. Gives the message back when no
    /// handler claims it.
    pub fn dispatch(&self, msg: M) -> Result<(), M> {
        let Some(key) = msg.route().map(str::to_owned) else {
            return Err(msg);
        };
        match self.inner.table.get(&key) {
            Some(tx) => tx.send(msg).map_err(|e| e.0),
            None => Err(msg),
        }
    }
}

/// One channel's hold on a shared table. Releasing the last lease closes
/// the table; releasing twice counts once.
pub struct Lease<M> {
    routes: Routes<M>,
    released: AtomicBool,
}

impl<M> Lease<M> {
    pub fn routes(&self) -> &Routes<M> {
        &self.routes
    }

    /// `true` when this release closed the table.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        if self.routes.inner.holders.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.routes.close();
            return true;
        }
        false
    }
}

impl<M> Drop for Lease<M> {
    fn drop(&mut self) {
        self.release();
    }
}

/// A claimed route. Unregisters itself on drop.
pub struct Subscription<M> {
    key: String,
    rx: mpsc::UnboundedReceiver<M>,
    routes: Routes<M>,
}

impl<M> Subscription<M> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Next routed message, or `None` once the channel has closed.
    pub async fn recv(&mut self) -> Option<M> {
        self.rx.recv().await
    }
}

impl<M> Drop for Subscription<M> {
    fn drop(&mut self) {
        self.routes.inner.table.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Reply(Option<&'static str>, u32);

    impl Routed for Reply {
        fn route(&self) -> Option<&str> {
            self.0
        }
    }

    #[tokio::test]
    async fn replies_reach_their_transaction_only() {
        let routes = Routes::new();
        let mut a = routes.register("a").unwrap();
        let mut b = routes.register("b").unwrap();

        routes.dispatch(Reply(Some("b"), 1)).unwrap();
        routes.dispatch(Reply(Some("a"), 2)).unwrap();

        assert_eq!(a.recv().await, Some(Reply(Some("a"), 2)));
        assert_eq!(b.recv().await, Some(Reply(Some("b"), 1)));
    }

    #[test]
    fn unrouted_messages_are_handed_back() {
        let routes: Routes<Reply> = Routes::new();
        assert_eq!(routes.dispatch(Reply(None, 1)), Err(Reply(None, 1)));
        assert_eq!(routes.dispatch(Reply(Some("x"), 2)), Err(Reply(Some("x"), 2)));
    }

    #[test]
    fn duplicate_keys_are_rejected_and_drop_unregisters() {
        let routes: Routes<Reply> = Routes::new();
        let sub = routes.register("t").unwrap();
        assert!(matches!(routes.register("t"), Err(ChannelError::DuplicateRoute(_))));
        drop(sub);
        assert!(routes.is_empty());
        assert!(routes.register("t").is_ok());
    }

    #[tokio::test]
    async fn table_closes_with_its_last_lease() {
        let routes: Routes<Reply> = Routes::new();
        let a = routes.lease();
        let b = routes.lease();
        let mut sub = routes.register("t").unwrap();

        assert!(!a.release());
        assert!(!a.release());
        assert!(!routes.is_closed());
        assert!(routes.register("u").is_ok());

        drop(b);
        assert!(routes.is_closed());
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn failed_route_ends_only_its_subscription() {
        let routes: Routes<Reply> = Routes::new();
        let mut dead = routes.register("dead").unwrap();
        let mut live = routes.register("live").unwrap();

        routes.fail("dead");
        assert_eq!(dead.recv().await, None);
        assert!(!routes.contains("dead"));
        routes.dispatch(Reply(Some("live"), 7)).unwrap();
        assert_eq!(live.recv().await, Some(Reply(Some("live"), 7)));
    }

    #[tokio::test]
    async fn close_ends_pending_subscriptions() {
        let routes: Routes<Reply> = Routes::new();
        let mut sub = routes.register("t").unwrap();
        routes.close();
        assert_eq!(sub.recv().await, None);
        assert!(matches!(routes.register("u"), Err(ChannelError::Closed)));
    }
}
