//! Opening, creating and force-recovering the write-ahead log.

use super::SnapshotMetadata;
use crate::config::ServerConfig;
use crate::error::{Result, TesseraError};
use crate::membership::{Member, RaftAttributes, Attributes};
use crate::raft::{
    effective_voters, ConfChange, ConfChangeType, HardState, LogEntry, MemoryStorage, Snapshot,
};
use crate::types::{Id, LogIndex, NodeId, Term};
use crate::wal::{self, Wal, WalSnapshot};
use tracing::{error, info};

/// Peer URL given to a member re-added during forced recovery.
const FORCED_SELF_PEER_URL: &str = "http://localhost:2380";

/// The log, and what was read from it.
#[derive(Debug)]
pub(super) struct BootstrappedWal {
    pub wal: Wal,
    pub state: HardState,
    pub entries: Vec<LogEntry>,
    pub snapshot: Option<Snapshot>,
}

impl BootstrappedWal {
    /// In-memory log storage: snapshot, then hard state, then entries.
    pub fn memory_storage(&self) -> Result<MemoryStorage> {
        let mut storage = MemoryStorage::new();
        if let Some(snapshot) = &self.snapshot {
            storage.apply_snapshot(snapshot.clone())?;
        }
        storage.set_hard_state(self.state);
        storage.append(&self.entries)?;
        Ok(storage)
    }

    /// Drop every entry past the hard state commit.
    pub fn committed_entries(&mut self) {
        let commit = self.state.commit;
        if let Some(pos) = self.entries.iter().position(|e| e.index > commit) {
            info!(
                entry_index = self.entries[pos].index,
                commit_index_from_wal = commit,
                number_of_discarded_entries = self.entries.len() - pos,
                "Discarding uncommitted WAL entries"
            );
            self.entries.truncate(pos);
        }
    }

    /// Membership changes that leave `self_id` as the only voter.
    pub fn config_change_entries(&self, self_id: Id) -> Result<Vec<LogEntry>> {
        let conf_state = self
            .snapshot
            .as_ref()
            .map(|s| s.metadata.conf_state.clone())
            .unwrap_or_default();
        let ids = effective_voters(&conf_state, &self.entries)?;
        create_config_change_entries(&ids, self_id.0, self.state.term, self.state.commit)
    }

    /// Append `entries` in memory and on disk, and commit through the last one.
    pub fn append_and_commit_entries(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        self.wal.save(&HardState::default(), &entries).map_err(|e| {
            error!(error = %e, "Failed to save hard state and entries");
            TesseraError::Fatal(format!("failed to save forced membership entries: {}", e))
        })?;
        self.entries.extend(entries);
        if let Some(last) = self.entries.last() {
            self.state.commit = last.index;
        }
        Ok(())
    }
}

/// Entries that add `self_id` if it is not a voter, then remove every other id.
///
/// Entries carry `term` and occupy the indices after `index`.
pub(super) fn create_config_change_entries(
    ids: &[NodeId],
    self_id: NodeId,
    term: Term,
    index: LogIndex,
) -> Result<Vec<LogEntry>> {
    let mut entries = Vec::new();
    let mut next = index + 1;

    // Adding self first keeps the voter set non-empty throughout.
    if !ids.contains(&self_id) {
        let member = Member {
            id: Id(self_id),
            raft_attributes: RaftAttributes {
                peer_urls: vec![FORCED_SELF_PEER_URL.to_string()],
                is_learner: false,
            },
            attributes: Attributes::default(),
        };
        let cc = ConfChange::new(ConfChangeType::AddNode, self_id, member.to_json()?);
        entries.push(LogEntry::conf_change(term, next, &cc)?);
        next += 1;
    }

    for &id in ids.iter().filter(|&&id| id != self_id) {
        let cc = ConfChange::new(ConfChangeType::RemoveNode, id, Vec::new());
        entries.push(LogEntry::conf_change(term, next, &cc)?);
        next += 1;
    }
    Ok(entries)
}

/// Create a fresh log recording the member and cluster ids.
pub(super) fn bootstrap_new_wal(cfg: &ServerConfig, node_id: Id, cluster_id: Id) -> Result<BootstrappedWal> {
    let metadata = SnapshotMetadata {
        node_id,
        cluster_id,
    }
    .encode()?;

    let mut w = Wal::create(&cfg.wal_dir(), &metadata).map_err(|e| {
        error!(dir = %cfg.wal_dir().display(), error = %e, "Failed to create WAL");
        TesseraError::Fatal(format!("failed to create WAL: {}", e))
    })?;
    if cfg.unsafe_no_fsync {
        w.set_unsafe_no_fsync();
    }

    Ok(BootstrappedWal {
        wal: w,
        state: HardState::default(),
        entries: Vec::new(),
        snapshot: None,
    })
}

/// Open the log at `snapshot` and, when forced, reduce membership to this member.
pub(super) fn bootstrap_wal_from_snapshot(
    cfg: &ServerConfig,
    snapshot: Option<Snapshot>,
) -> Result<(BootstrappedWal, SnapshotMetadata)> {
    let (w, state, entries, meta) = open_wal_from_snapshot(cfg, snapshot.as_ref())?;
    let mut bwal = BootstrappedWal {
        wal: w,
        state,
        entries,
        snapshot,
    };

    if cfg.force_new_cluster {
        bwal.committed_entries();
        let entries = bwal.config_change_entries(meta.node_id)?;
        bwal.append_and_commit_entries(entries)?;
        info!(
            cluster_id = %meta.cluster_id,
            local_member_id = %meta.node_id,
            commit_index = bwal.state.commit,
            "Forcing restart member"
        );
    } else {
        info!(
            cluster_id = %meta.cluster_id,
            local_member_id = %meta.node_id,
            commit_index = bwal.state.commit,
            "Restarting local member"
        );
    }
    Ok((bwal, meta))
}

fn open_wal_from_snapshot(
    cfg: &ServerConfig,
    snapshot: Option<&Snapshot>,
) -> Result<(Wal, HardState, Vec<LogEntry>, SnapshotMetadata)> {
    let walsnap = snapshot
        .map(|s| WalSnapshot::new(s.metadata.index, s.metadata.term))
        .unwrap_or_default();
    let dir = cfg.wal_dir();

    let (w, metadata, state, entries) = open_with_single_repair(
        || {
            let mut w = Wal::open(&dir, walsnap.clone()).map_err(|e| {
                error!(dir = %dir.display(), error = %e, "Failed to open WAL");
                TesseraError::Fatal(format!("failed to open WAL: {}", e))
            })?;
            if cfg.unsafe_no_fsync {
                w.set_unsafe_no_fsync();
            }
            match w.read_all() {
                Ok((metadata, state, entries)) => Ok((w, metadata, state, entries)),
                Err(e) => {
                    let _ = w.close();
                    Err(e)
                }
            }
        },
        || wal::repair(&dir),
    )?;

    let meta = SnapshotMetadata::decode(&metadata).map_err(|e| {
        error!(error = %e, "Failed to decode WAL metadata");
        TesseraError::Fatal(format!("failed to decode WAL metadata: {}", e))
    })?;
    Ok((w, state, entries, meta))
}

/// Run `attempt`, repairing at most once when it stops at a torn record.
///
/// Any other failure, a failed repair, or a second torn read is fatal.
pub(super) fn open_with_single_repair<T>(
    mut attempt: impl FnMut() -> Result<T>,
    mut repair: impl FnMut() -> bool,
) -> Result<T> {
    let mut repair_attempted = false;
    loop {
        let err = match attempt() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => e,
        };

        if repair_attempted || !err.is_unexpected_eof() {
            error!(error = %err, "Failed to read WAL, cannot be repaired");
            return Err(TesseraError::Fatal(format!(
                "failed to read WAL, cannot be repaired: {}",
                err
            )));
        }
        if !repair() {
            error!(error = %err, "Failed to repair WAL");
            return Err(TesseraError::Fatal(format!("failed to repair WAL: {}", err)));
        }
        info!(error = %err, "Repaired WAL");
        repair_attempted = true;
    }
}
