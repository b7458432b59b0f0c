//! Lock tree — reference state for the cleanup agent.
//!
//! Nodes live in a flat arena addressed by index. Each node knows its parent
//! and maps child names to indices. Index 0 is the root directory.
//!
//! A node is `Locked` or `Unlocked` once a caller has named it, or `Implied`
//! when it only exists because a descendant was named. `flush` hands back
//! every registered path that is unlocked and has no locked descendant,
//! deepest first, and prunes those nodes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::paths;
use crate::wire::{codes, Code};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Ancestor of a registered node, never named itself.
    Implied,
    Locked,
    Unlocked,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockTreeError {
    #[error("path {0:?} is not below the lock tree root")]
    NotChild(String),
    #[error("path {0:?} is not registered")]
    NotRegistered(String),
}

impl LockTreeError {
    pub fn code(&self) -> Code {
        match self {
            Self::NotChild(_) => codes::NOT_CHILD,
            Self::NotRegistered(_) => codes::NOT_REGISTERED,
        }
    }
}

#[derive(Debug)]
struct Node {
    name: String,
    parent: Option<usize>,
    children: BTreeMap<String, usize>,
    state: LockState,
    live: bool,
}

const ROOT: usize = 0;

#[derive(Debug)]
pub struct LockTree {
    root: PathBuf,
    nodes: Vec<Node>,
    free: Vec<usize>,
}

impl LockTree {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: paths::normalize(root),
            nodes: vec![Node {
                name: String::new(),
                parent: None,
                children: BTreeMap::new(),
                state: LockState::Implied,
                live: true,
            }],
            free: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Mark `path` locked, creating implied ancestors as needed.
    pub fn lock(&mut self, path: &str) -> Result<(), LockTreeError> {
        let segments = self.segments(path)?;
        let mut idx = ROOT;
        for seg in segments {
            idx = match self.nodes[idx].children.get(&seg) {
                Some(&child) => child,
                None => self.alloc(seg, idx),
            };
        }
        self.nodes[idx].state = LockState::Locked;
        Ok(())
    }

    /// Mark a registered `path` unlocked. Nothing is deleted here.
    pub fn unlock(&mut self, path: &str) -> Result<(), LockTreeError> {
        let segments = self.segments(path)?;
        match self.find(&segments) {
            Some(idx) if self.nodes[idx].state != LockState::Implied => {
                self.nodes[idx].state = LockState::Unlocked;
                Ok(())
            }
            _ => Err(LockTreeError::NotRegistered(path.to_string())),
        }
    }

    /// Lock every path, or none of them when any path is outside the root.
    pub fn lock_all<S: AsRef<str>>(&mut self, paths: &[S]) -> Result<(), LockTreeError> {
        for path in paths {
            self.segments(path.as_ref())?;
        }
        for path in paths {
            self.lock(path.as_ref())?;
        }
        Ok(())
    }

    /// Unlock every path, or none of them when any path is not registered.
    pub fn unlock_all<S: AsRef<str>>(&mut self, paths: &[S]) -> Result<(), LockTreeError> {
        for path in paths {
            let path = path.as_ref();
            match self.state(path) {
                Some(LockState::Locked | LockState::Unlocked) => {}
                _ => {
                    self.segments(path)?;
                    return Err(LockTreeError::NotRegistered(path.to_string()));
                }
            }
        }
        for path in paths {
            self.unlock(path.as_ref())?;
        }
        Ok(())
    }

    /// State of the node at `path`, if it exists.
    pub fn state(&self, path: &str) -> Option<LockState> {
        let segments = self.segments(path).ok()?;
        self.find(&segments).map(|idx| self.nodes[idx].state)
    }

    /// True when `path` or any of its descendants is locked.
    pub fn is_locked(&self, path: &str) -> bool {
        self.segments(path)
            .ok()
            .and_then(|s| self.find(&s))
            .map(|idx| self.subtree_locked(idx))
            .unwrap_or(false)
    }

    /// Registered paths that `flush` would delete, deepest first.
    pub fn unlocked(&self) -> Vec<PathBuf> {
        self.candidates()
            .into_iter()
            .map(|idx| self.path_of(idx))
            .collect()
    }

    /// Prune every deletable node and return the paths to delete, deepest first.
    pub fn flush(&mut self) -> Vec<PathBuf> {
        let mut deleted = Vec::new();
        for idx in self.candidates() {
            if !self.nodes[idx].live {
                continue;
            }
            deleted.push(self.path_of(idx));
            self.remove(idx);
        }
        deleted
    }

    /// Every registered (non-implied) path with its state.
    pub fn registered(&self) -> Vec<(PathBuf, LockState)> {
        (0..self.nodes.len())
            .filter(|&i| self.nodes[i].live && self.nodes[i].state != LockState::Implied)
            .map(|i| (self.path_of(i), self.nodes[i].state))
            .collect()
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn segments(&self, path: &str) -> Result<Vec<String>, LockTreeError> {
        paths::relative_segments(&self.root, path)
            .ok_or_else(|| LockTreeError::NotChild(path.to_string()))
    }

    fn find(&self, segments: &[String]) -> Option<usize> {
        let mut idx = ROOT;
        for seg in segments {
            idx = *self.nodes[idx].children.get(seg)?;
        }
        Some(idx)
    }

    fn alloc(&mut self, name: String, parent: usize) -> usize {
        let node = Node {
            name: name.clone(),
            parent: Some(parent),
            children: BTreeMap::new(),
            state: LockState::Implied,
            live: true,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.nodes[parent].children.insert(name, idx);
        idx
    }

    fn subtree_locked(&self, idx: usize) -> bool {
        let mut stack = vec![idx];
        while let Some(i) = stack.pop() {
            if self.nodes[i].state == LockState::Locked {
                return true;
            }
            stack.extend(self.nodes[i].children.values().copied());
        }
        false
    }

    fn depth(&self, mut idx: usize) -> usize {
        let mut depth = 0;
        while let Some(parent) = self.nodes[idx].parent {
            depth += 1;
            idx = parent;
        }
        depth
    }

    fn path_of(&self, mut idx: usize) -> PathBuf {
        let mut names = Vec::new();
        while let Some(parent) = self.nodes[idx].parent {
            names.push(self.nodes[idx].name.as_str());
            idx = parent;
        }
        let mut path = self.root.clone();
        path.extend(names.into_iter().rev());
        path
    }

    fn candidates(&self) -> Vec<usize> {
        let mut found: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| {
                self.nodes[i].live
                    && self.nodes[i].state == LockState::Unlocked
                    && !self.subtree_locked(i)
            })
            .collect();
        found.sort_by_key(|&i| std::cmp::Reverse(self.depth(i)));
        found
    }

    /// Drop `idx` and its subtree, then prune implied ancestors left childless.
    fn remove(&mut self, idx: usize) {
        let mut stack: Vec<usize> = self.nodes[idx].children.values().copied().collect();
        while let Some(i) = stack.pop() {
            stack.extend(self.nodes[i].children.values().copied());
            self.release(i);
        }
        self.nodes[idx].children.clear();

        if idx == ROOT {
            self.nodes[ROOT].state = LockState::Implied;
            return;
        }

        let mut child = idx;
        while let Some(parent) = self.nodes[child].parent {
            let name = self.nodes[child].name.clone();
            self.nodes[parent].children.remove(&name);
            self.release(child);
            let p = &self.nodes[parent];
            if parent == ROOT || p.state != LockState::Implied || !p.children.is_empty() {
                break;
            }
            child = parent;
        }
    }

    fn release(&mut self, idx: usize) {
        let node = &mut self.nodes[idx];
        node.live = false;
        node.children.clear();
        self.free.push(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> LockTree {
        LockTree::new("/srv/cleanup")
    }

    fn p(rel: &str) -> PathBuf {
        Path::new("/srv/cleanup").join(rel)
    }

    #[test]
    fn lock_creates_implied_ancestors() {
        let mut t = tree();
        t.lock("batch/job1").unwrap();
        assert_eq!(t.state("batch"), Some(LockState::Implied));
        assert_eq!(t.state("batch/job1"), Some(LockState::Locked));
        assert!(t.is_locked("batch"));
    }

    #[test]
    fn relocking_is_idempotent() {
        let mut t = tree();
        t.lock("a").unwrap();
        t.lock("a").unwrap();
        assert_eq!(t.registered(), vec![(p("a"), LockState::Locked)]);
    }

    #[test]
    fn paths_are_normalised_before_lookup() {
        let mut t = tree();
        t.lock("a/../a/b").unwrap();
        assert_eq!(t.state("a/b"), Some(LockState::Locked));
        t.unlock("/srv/cleanup/a/./b").unwrap();
        assert_eq!(t.state("a/b"), Some(LockState::Unlocked));
    }

    #[test]
    fn paths_outside_root_are_rejected() {
        let mut t = tree();
        let err = t.lock("../escape").unwrap_err();
        assert_eq!(err.code(), codes::NOT_CHILD);
        assert!(t.lock("/etc").is_err());
    }

    #[test]
    fn unlocking_unknown_or_implied_is_not_registered() {
        let mut t = tree();
        assert_eq!(
            t.unlock("nope").unwrap_err(),
            LockTreeError::NotRegistered("nope".into())
        );
        t.lock("a/b").unwrap();
        assert_eq!(t.unlock("a").unwrap_err().code(), codes::NOT_REGISTERED);
    }

    #[test]
    fn multi_path_requests_apply_all_or_nothing() {
        let mut t = tree();
        let err = t.lock_all(&["a", "b/c", "../escape"]).unwrap_err();
        assert_eq!(err.code(), codes::NOT_CHILD);
        assert!(t.registered().is_empty());

        t.lock_all(&["a", "b/c"]).unwrap();
        let err = t.unlock_all(&["a", "b", "b/c"]).unwrap_err();
        assert_eq!(err, LockTreeError::NotRegistered("b".into()));
        assert_eq!(t.state("a"), Some(LockState::Locked));
        assert_eq!(t.state("b/c"), Some(LockState::Locked));

        t.unlock_all(&["a", "b/c"]).unwrap();
        assert_eq!(t.state("a"), Some(LockState::Unlocked));
        assert_eq!(t.state("b/c"), Some(LockState::Unlocked));
    }

    #[test]
    fn flush_deletes_only_fully_unlocked_subtrees() {
        let mut t = tree();
        t.lock("batch").unwrap();
        t.lock("batch/job1").unwrap();
        t.lock("batch/job2").unwrap();

        t.unlock("batch/job1").unwrap();
        assert_eq!(t.flush(), vec![p("batch/job1")]);
        assert_eq!(t.state("batch/job1"), None);

        // Batch unlocked while a job is still locked survives.
        t.unlock("batch").unwrap();
        assert!(t.flush().is_empty());

        t.unlock("batch/job2").unwrap();
        assert_eq!(t.flush(), vec![p("batch/job2"), p("batch")]);
        assert!(t.registered().is_empty());
    }

    #[test]
    fn flush_prunes_implied_ancestors() {
        let mut t = tree();
        t.lock("x/y/z").unwrap();
        t.unlock("x/y/z").unwrap();
        assert_eq!(t.flush(), vec![p("x/y/z")]);
        assert_eq!(t.state("x"), None);
        assert_eq!(t.state("x/y"), None);
    }

    #[test]
    fn arena_slots_are_reused() {
        let mut t = tree();
        t.lock("a").unwrap();
        t.unlock("a").unwrap();
        t.flush();
        let before = t.nodes.len();
        t.lock("b").unwrap();
        assert_eq!(t.nodes.len(), before);
        assert_eq!(t.state("b"), Some(LockState::Locked));
    }

    /// For random LOCK/UNLOCK sequences, flush deletes exactly the registered
    /// paths that are unlocked along with all their descendants.
    #[test]
    fn flush_matches_lock_invariant_for_random_sequences() {
        let universe = ["a", "a/b", "a/b/c", "a/d", "e", "e/f"];
        let mut seed: u64 = 0x5eed;
        let mut next = || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as usize
        };

        for _ in 0..200 {
            let mut t = tree();
            let mut model: BTreeMap<&str, bool> = BTreeMap::new();
            for _ in 0..12 {
                let path = universe[next() % universe.len()];
                if next() % 2 == 0 {
                    t.lock(path).unwrap();
                    model.insert(path, true);
                } else if model.contains_key(path) {
                    t.unlock(path).unwrap();
                    model.insert(path, false);
                }
            }

            let expected: Vec<PathBuf> = model
                .iter()
                .filter(|(path, locked)| {
                    !**locked
                        && model.iter().all(|(other, other_locked)| {
                            !(other.starts_with(&format!("{path}/")) && *other_locked)
                        })
                })
                .map(|(path, _)| p(path))
                .collect();

            let mut deleted = t.flush();
            deleted.sort();
            let mut expected = expected;
            expected.sort();
            assert_eq!(deleted, expected);
        }
    }
}
