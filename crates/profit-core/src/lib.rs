//! profit-core — wire format, protocol message sets, lock tree and config.
//! All other profit crates depend on this one.

pub mod cleanup;
pub mod config;
pub mod locktree;
pub mod paths;
pub mod queue;
pub mod run;
pub mod transfer;
pub mod wire;

pub use locktree::{LockState, LockTree, LockTreeError};
pub use wire::{ErrorCode, Inbound, MessageSet, Routed, StartMessage, StartReply, WireError};
