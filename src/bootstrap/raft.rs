//! Building the consensus engine from resolved membership and log.

use super::wal::BootstrappedWal;
use super::SnapshotMetadata;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::membership::RaftCluster;
use crate::raft::{Config, MemoryStorage, Peer, RaftNode, StatusSlot, TracingLogger};
use crate::types::Id;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Everything needed to start or restart the engine.
#[derive(Debug)]
pub(super) struct BootstrappedRaft {
    pub heartbeat: Duration,
    pub config: Config,
    pub peers: Vec<Peer>,
    pub storage: MemoryStorage,
}

impl BootstrappedRaft {
    /// Engine for a member with no log. `ids` lists the initial peers; none
    /// when joining a running cluster.
    pub fn from_cluster(
        cfg: &ServerConfig,
        cl: &RaftCluster,
        node_id: Id,
        ids: &[Id],
        bwal: &BootstrappedWal,
    ) -> Result<Self> {
        let mut peers = Vec::with_capacity(ids.len());
        for &id in ids {
            let context = match cl.member(id) {
                Some(m) => m.to_json()?,
                None => Vec::new(),
            };
            peers.push(Peer { id: id.0, context });
        }

        info!(local_member_id = %node_id, cluster_id = %cl.id(), "Starting local member");

        Ok(Self {
            heartbeat: cfg.tick,
            config: raft_config(cfg, node_id),
            peers,
            storage: bwal.memory_storage()?,
        })
    }

    /// Engine for a member restarting from its log.
    pub fn from_snapshot(cfg: &ServerConfig, bwal: &BootstrappedWal, meta: &SnapshotMetadata) -> Result<Self> {
        Ok(Self {
            heartbeat: cfg.tick,
            config: raft_config(cfg, meta.node_id),
            peers: Vec::new(),
            storage: bwal.memory_storage()?,
        })
    }

    /// Start the engine when peers are given, restart it otherwise, and
    /// publish its status accessor.
    pub fn new_raft_node(self, status: &StatusSlot) -> Result<RaftNode> {
        let node = if self.peers.is_empty() {
            RaftNode::restart(self.config, self.storage)?
        } else {
            RaftNode::start(self.config, self.storage, &self.peers)?
        };
        status.publish(node.status_fn())?;
        Ok(node)
    }
}

fn raft_config(cfg: &ServerConfig, id: Id) -> Config {
    Config {
        id: id.0,
        election_tick: cfg.election_ticks,
        heartbeat_tick: 1,
        applied: 0,
        max_size_per_msg: cfg.max_size_per_msg,
        max_inflight_msgs: cfg.max_inflight_msgs,
        check_quorum: true,
        pre_vote: cfg.pre_vote,
        logger: Arc::new(TracingLogger::new(id.0)),
    }
}
