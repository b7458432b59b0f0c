//! Scheduler membership as seen through `QSELECT` snapshots.
//!
//! Each snapshot is diffed against the previous one. A non-empty diff goes
//! out to every listener as one [`Membership`] change; the latest snapshot
//! itself is kept on a watch channel so a late subscriber can check whether
//! a job is already visible.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};

/// Buffered membership changes per listener.
const EVENT_CAPACITY: usize = 256;

/// One snapshot's worth of change. Listeners handle `removed` before `added`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl Membership {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// `added = new - old`, `removed = old - new`.
pub fn diff(old: &BTreeSet<String>, new: &BTreeSet<String>) -> Membership {
    Membership {
        added: new.difference(old).cloned().collect(),
        removed: old.difference(new).cloned().collect(),
    }
}

pub struct QueueState {
    snapshot: watch::Sender<BTreeSet<String>>,
    events: broadcast::Sender<Arc<Membership>>,
}

impl Default for QueueState {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueState {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(BTreeSet::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { snapshot, events }
    }

    /// Take a new snapshot. Returns the change it caused, if any.
    pub fn apply(&self, ids: impl IntoIterator<Item = String>) -> Option<Arc<Membership>> {
        let new: BTreeSet<String> = ids.into_iter().collect();
        let mut change = None;
        self.snapshot.send_modify(|current| {
            let delta = diff(current, &new);
            *current = new;
            if !delta.is_empty() {
                change = Some(Arc::new(delta));
            }
        });
        if let Some(change) = &change {
            tracing::debug!(added = ?change.added, removed = ?change.removed, "queue membership changed");
            let _ = self.events.send(change.clone());
        }
        change
    }

    pub fn contains(&self, id: &str) -> bool {
        self.snapshot.borrow().contains(id)
    }

    pub fn snapshot(&self) -> BTreeSet<String> {
        self.snapshot.borrow().clone()
    }

    /// Listen for changes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Membership>> {
        self.events.subscribe()
    }
}
