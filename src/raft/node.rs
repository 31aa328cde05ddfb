//! Raft node construction: configuration, peers, start and restart.

use super::state::{ConfState, HardState, RaftState, Status};
use super::{ConfChange, ConfChangeType, LogEntry, MemoryStorage};
use crate::error::{Result, TesseraError};
use crate::types::{LogIndex, NodeId};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Sink for engine log lines.
pub trait RaftLogger: Send + Sync + fmt::Debug {
    fn debug(&self, msg: &str);
    fn info(&self, msg: &str);
    fn warn(&self, msg: &str);
    fn error(&self, msg: &str);
}

/// Forwards engine log lines to `tracing`, tagged with the node id.
#[derive(Debug, Clone)]
pub struct TracingLogger {
    node_id: NodeId,
}

impl TracingLogger {
    pub fn new(node_id: NodeId) -> Self {
        Self { node_id }
    }
}

impl RaftLogger for TracingLogger {
    fn debug(&self, msg: &str) {
        tracing::debug!(target: "tessera::raft", node_id = self.node_id, "{}", msg);
    }

    fn info(&self, msg: &str) {
        tracing::info!(target: "tessera::raft", node_id = self.node_id, "{}", msg);
    }

    fn warn(&self, msg: &str) {
        tracing::warn!(target: "tessera::raft", node_id = self.node_id, "{}", msg);
    }

    fn error(&self, msg: &str) {
        tracing::error!(target: "tessera::raft", node_id = self.node_id, "{}", msg);
    }
}

/// Raft configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// This node's ID.
    pub id: NodeId,
    /// Ticks without hearing from a leader before campaigning.
    pub election_tick: usize,
    /// Ticks between leader heartbeats.
    pub heartbeat_tick: usize,
    /// Last applied index, for restarts.
    pub applied: LogIndex,
    /// Byte cap on a single append message.
    pub max_size_per_msg: u64,
    /// Append messages allowed in flight per follower.
    pub max_inflight_msgs: usize,
    /// Step down when a quorum stops responding.
    pub check_quorum: bool,
    /// Enable pre-vote protocol to prevent disruptions.
    pub pre_vote: bool,
    pub logger: Arc<dyn RaftLogger>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.id == 0 {
            return Err(TesseraError::InvalidConfig {
                field: "raft.id".to_string(),
                reason: "cannot use none as id".to_string(),
            });
        }
        if self.heartbeat_tick == 0 {
            return Err(TesseraError::InvalidConfig {
                field: "raft.heartbeat_tick".to_string(),
                reason: "heartbeat tick must be greater than 0".to_string(),
            });
        }
        if self.election_tick <= self.heartbeat_tick {
            return Err(TesseraError::InvalidConfig {
                field: "raft.election_tick".to_string(),
                reason: "election tick must be greater than heartbeat tick".to_string(),
            });
        }
        if self.max_inflight_msgs == 0 {
            return Err(TesseraError::InvalidConfig {
                field: "raft.max_inflight_msgs".to_string(),
                reason: "max inflight messages must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// A member the node is started with. `context` is opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: NodeId,
    pub context: Vec<u8>,
}

/// Voters after replaying the membership changes in `entries` on top of a
/// snapshot's configuration. Sorted.
pub fn effective_voters(conf_state: &ConfState, entries: &[LogEntry]) -> Result<Vec<NodeId>> {
    let mut ids: BTreeSet<NodeId> = conf_state.voters.iter().copied().collect();
    for entry in entries {
        let Some(cc) = entry.as_conf_change()? else {
            continue;
        };
        match cc.change_type {
            ConfChangeType::AddNode => {
                ids.insert(cc.node_id);
            }
            ConfChangeType::RemoveNode => {
                ids.remove(&cc.node_id);
            }
            ConfChangeType::UpdateNode | ConfChangeType::AddLearnerNode => {}
        }
    }
    Ok(ids.into_iter().collect())
}

/// A constructed Raft node, primed with its log and ready to be driven.
pub struct RaftNode {
    config: Config,
    state: Arc<RwLock<RaftState>>,
    storage: Arc<RwLock<MemoryStorage>>,
}

impl RaftNode {
    /// Start a brand new node. One AddNode entry per peer is written at term 1
    /// and committed, so every member begins from the same configuration.
    pub fn start(config: Config, mut storage: MemoryStorage, peers: &[Peer]) -> Result<Self> {
        config.validate()?;
        if peers.is_empty() {
            return Err(TesseraError::RaftConsensus(
                "no peers given; use restart for a node without peers".to_string(),
            ));
        }
        if storage.last_index() != 0 {
            return Err(TesseraError::RaftConsensus(format!(
                "can't bootstrap a nonempty storage (last index {})",
                storage.last_index()
            )));
        }

        let mut entries = Vec::with_capacity(peers.len());
        for (i, peer) in peers.iter().enumerate() {
            let cc = ConfChange::new(ConfChangeType::AddNode, peer.id, peer.context.clone());
            entries.push(LogEntry::conf_change(1, i as u64 + 1, &cc)?);
        }
        storage.append(&entries)?;

        let hard_state = HardState {
            term: 1,
            vote: 0,
            commit: entries.len() as u64,
        };
        storage.set_hard_state(hard_state);

        let voters = peers.iter().map(|p| p.id).collect();
        let mut state = RaftState::new(config.id, voters);
        state.become_follower(1, None);
        state.hard_state = hard_state;
        state.randomized_election_timeout = randomized_timeout(config.election_tick);

        config.logger.info(&format!(
            "starting node {:x} with {} peers, term 1, commit {}",
            config.id,
            peers.len(),
            hard_state.commit
        ));

        Ok(Self::assemble(config, state, storage))
    }

    /// Restart a node from whatever the storage already holds.
    pub fn restart(config: Config, storage: MemoryStorage) -> Result<Self> {
        config.validate()?;

        let (hard_state, conf_state) = storage.initial_state();
        let snap_index = storage.snapshot().metadata.index;
        if !hard_state.is_empty()
            && (hard_state.commit < snap_index || hard_state.commit > storage.last_index())
        {
            return Err(TesseraError::RaftConsensus(format!(
                "commit {} is out of range [{}, {}]",
                hard_state.commit,
                snap_index,
                storage.last_index()
            )));
        }

        let committed = storage.entries(storage.first_index(), hard_state.commit.max(snap_index) + 1)?;
        let voters = effective_voters(&conf_state, &committed)?;

        let mut state = RaftState::new(config.id, voters);
        state.hard_state = hard_state;
        state.become_follower(hard_state.term, None);
        state.applied = config.applied.max(snap_index);
        state.randomized_election_timeout = randomized_timeout(config.election_tick);

        let last_term = storage.term(storage.last_index())?;
        config.logger.info(&format!(
            "restarting node {:x} [term: {}, commit: {}, applied: {}, last index: {}, last term: {}]",
            config.id,
            hard_state.term,
            hard_state.commit,
            state.applied,
            storage.last_index(),
            last_term
        ));

        Ok(Self::assemble(config, state, storage))
    }

    fn assemble(config: Config, state: RaftState, storage: MemoryStorage) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(state)),
            storage: Arc::new(RwLock::new(storage)),
        }
    }

    pub fn id(&self) -> NodeId {
        self.config.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn status(&self) -> Status {
        self.state.read().status()
    }

    /// Shared handle to the node's log storage.
    pub fn storage(&self) -> Arc<RwLock<MemoryStorage>> {
        Arc::clone(&self.storage)
    }

    /// A closure that reads this node's status, for observers that outlive a borrow.
    pub fn status_fn(&self) -> StatusFn {
        let state = Arc::clone(&self.state);
        Arc::new(move || state.read().status())
    }
}

impl fmt::Debug for RaftNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaftNode")
            .field("id", &format_args!("{:x}", self.config.id))
            .field("status", &self.status())
            .finish()
    }
}

fn randomized_timeout(election_tick: usize) -> usize {
    rand::thread_rng().gen_range(election_tick..2 * election_tick)
}

/// Reads a node's current status.
pub type StatusFn = Arc<dyn Fn() -> Status + Send + Sync>;

/// Write-once holder for the engine status accessor.
///
/// Owned by the replica handle. The first `publish` wins; later calls are
/// rejected so observers never see the accessor swapped underneath them.
#[derive(Default)]
pub struct StatusSlot {
    inner: Mutex<Option<StatusFn>>,
}

impl StatusSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, status: StatusFn) -> Result<()> {
        let mut slot = self.inner.lock();
        if slot.is_some() {
            return Err(TesseraError::AlreadyExists(
                "raft status accessor already published".to_string(),
            ));
        }
        *slot = Some(status);
        Ok(())
    }

    /// Current status, or `None` before the node is published.
    pub fn get(&self) -> Option<Status> {
        let accessor = self.inner.lock().clone();
        accessor.map(|f| f())
    }

    pub fn is_published(&self) -> bool {
        self.inner.lock().is_some()
    }
}

impl fmt::Debug for StatusSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusSlot")
            .field("published", &self.is_published())
            .finish()
    }
}
