//! Consensus engine primitives used to bring a replica online.
//!
//! The bootstrap fills a [`MemoryStorage`] from the durable log, derives a
//! [`Config`] and a peer list from the resolved membership, then either starts
//! a fresh [`RaftNode`] or restarts one from storage. Message replication and
//! elections are driven by the serving loop once bootstrap hands the node over.

// Deny unsafe code patterns in this critical consensus module.
// unwrap() calls can cause panics that break consensus.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod log;
mod node;
mod state;
mod storage;

pub use log::{ConfChange, ConfChangeType, EntryType, LogEntry};
pub use node::{
    effective_voters, Config, Peer, RaftLogger, RaftNode, StatusFn, StatusSlot, TracingLogger,
};
pub use state::{ConfState, HardState, NodeState, RaftState, Status};
pub use storage::{MemoryStorage, Snapshot, SnapshotMeta};
