//! Replica bootstrap.
//!
//! [`bootstrap`] takes a replica from whatever is on disk to a constructed
//! consensus engine:
//!
//! 1. prepare the data, snapshot and member directories;
//! 2. open the backend, recovering it from the newest snapshot when a log exists;
//! 3. resolve membership by joining a running cluster, forming a new one, or
//!    restarting from the log;
//! 4. build the engine and hand everything back as a [`BootstrappedServer`].
//!
//! The backend is closed on every failure after it is opened. Unrecoverable
//! on-disk damage surfaces as [`TesseraError::Fatal`].

mod backend;
mod cluster;
mod raft;
mod wal;

use crate::backend::{update_storage_version, Backend};
use crate::config::{ServerConfig, RECOMMENDED_MAX_REQUEST_BYTES};
use crate::error::{Result, TesseraError};
use crate::membership::{Member, RaftCluster};
use crate::raft::{RaftNode, Status, StatusSlot};
use crate::snap::Snapshotter;
use crate::types::Id;
use crate::v2store::Store;
use crate::version::Capabilities;
use crate::wal::Wal;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Identity recorded in the log when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub node_id: Id,
    pub cluster_id: Id,
}

impl SnapshotMetadata {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&(self.node_id.0, self.cluster_id.0))?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (node_id, cluster_id): (u64, u64) = bincode::deserialize(data)
            .map_err(|e| TesseraError::Deserialization(format!("log metadata: {}", e)))?;
        Ok(Self {
            node_id: Id(node_id),
            cluster_id: Id(cluster_id),
        })
    }
}

/// How membership was established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapPath {
    /// No log, joining a running cluster whose members are `remotes`.
    JoinExisting { remotes: Vec<Member> },
    /// No log, forming a new cluster.
    NewCluster,
    /// A log exists; identity comes from its metadata.
    RestartFromLog { meta: SnapshotMetadata },
}

/// A replica ready to be driven.
#[derive(Debug)]
pub struct BootstrappedServer {
    pub backend: Backend,
    pub wal: Wal,
    pub cluster: RaftCluster,
    pub node: RaftNode,
    pub store: Arc<RwLock<Store>>,
    pub snapshotter: Snapshotter,
    pub capabilities: Capabilities,
    pub path: BootstrapPath,
    /// Whether the backend existed before this start.
    pub be_exist: bool,
    status: StatusSlot,
}

impl BootstrappedServer {
    pub fn node_id(&self) -> Id {
        Id(self.node.id())
    }

    pub fn cluster_id(&self) -> Id {
        self.cluster.id()
    }

    /// Current engine status.
    pub fn status(&self) -> Option<Status> {
        self.status.get()
    }

    /// Members of the running cluster reported while joining it.
    pub fn remotes(&self) -> &[Member] {
        match &self.path {
            BootstrapPath::JoinExisting { remotes } => remotes,
            _ => &[],
        }
    }

    /// Flush and release the log and the backend.
    pub fn close(self) -> Result<()> {
        self.wal.close()?;
        self.backend.close()
    }
}

/// Bring a replica from its on-disk state to a constructed engine.
pub async fn bootstrap(cfg: &ServerConfig) -> Result<BootstrappedServer> {
    if cfg.max_request_bytes > RECOMMENDED_MAX_REQUEST_BYTES {
        warn!(
            max_request_bytes = cfg.max_request_bytes,
            recommended_request_bytes = RECOMMENDED_MAX_REQUEST_BYTES,
            "Exceeded recommended request limit"
        );
    }

    touch_dir_all(&cfg.data_dir)
        .map_err(|e| TesseraError::Storage(format!("cannot access data directory: {}", e)))?;
    let snapshotter = bootstrap_snapshotter(cfg)?;
    touch_dir_all(&cfg.member_dir())
        .map_err(|e| TesseraError::Storage(format!("cannot access member directory: {}", e)))?;

    let have_wal = crate::wal::exist(&cfg.wal_dir());
    let store = Arc::new(RwLock::new(Store::new()));
    let mut bbe = backend::bootstrap_backend(cfg, have_wal, &store, &snapshotter)?;

    let bcl = match cluster::bootstrap_cluster(cfg, have_wal, &store, &mut bbe).await {
        Ok(bcl) => bcl,
        Err(e) => {
            bbe.close_after_failure();
            return Err(e);
        }
    };

    let status = StatusSlot::new();
    let cluster::BootstrappedCluster {
        cluster,
        node_id,
        wal,
        raft,
        path,
        capabilities,
    } = bcl;

    let node = match raft.new_raft_node(&status) {
        Ok(node) => node,
        Err(e) => {
            let _ = wal.wal.close();
            bbe.close_after_failure();
            return Err(e);
        }
    };

    if !bbe.be_exist {
        if let Err(e) = update_storage_version(&bbe.backend) {
            let _ = wal.wal.close();
            bbe.close_after_failure();
            return Err(e);
        }
    }

    info!(
        local_member_id = %node_id,
        cluster_id = %cluster.id(),
        path = ?path_name(&path),
        "Bootstrapped member"
    );

    Ok(BootstrappedServer {
        backend: bbe.backend,
        wal: wal.wal,
        cluster,
        node,
        store,
        snapshotter,
        capabilities,
        path,
        be_exist: bbe.be_exist,
        status,
    })
}

fn path_name(path: &BootstrapPath) -> &'static str {
    match path {
        BootstrapPath::JoinExisting { .. } => "join-existing",
        BootstrapPath::NewCluster => "new-cluster",
        BootstrapPath::RestartFromLog { .. } => "restart-from-log",
    }
}

/// Prepare the snapshot directory, dropping leftover temp files.
fn bootstrap_snapshotter(cfg: &ServerConfig) -> Result<Snapshotter> {
    let dir = cfg.snap_dir();
    touch_dir_all(&dir).map_err(|e| {
        error!(path = %dir.display(), error = %e, "Failed to create snapshot directory");
        TesseraError::Fatal(format!("failed to create snapshot directory: {}", e))
    })?;

    if let Err(e) = remove_tmp_files(&dir) {
        error!(path = %dir.display(), error = %e, "Failed to remove temp file(s) in snapshot directory");
    }
    Ok(Snapshotter::new(dir))
}

fn remove_tmp_files(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with("tmp") {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        info!(path = %path.display(), "Removed temp file");
    }
    Ok(())
}

/// Create `dir` and its parents, then make sure it is writeable.
fn touch_dir_all(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    check_dir_writeable(dir)
}

fn check_dir_writeable(dir: &Path) -> Result<()> {
    let probe = dir.join(".touch");
    fs::write(&probe, b"")?;
    fs::remove_file(&probe)?;
    Ok(())
}
