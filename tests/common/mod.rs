//! Common test utilities for integration tests.

use axum::{routing::post, Json, Router};
use std::net::TcpListener as StdTcpListener;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tessera::backend::{update_storage_version, Backend};
use tessera::bootstrap::SnapshotMetadata;
use tessera::config::ServerConfig;
use tessera::membership::{Member, RaftCluster};
use tessera::peer::{self, PeerState};
use tessera::raft::{ConfState, HardState, LogEntry, Snapshot, SnapshotMeta};
use tessera::snap::Snapshotter;
use tessera::types::Id;
use tessera::v2store::Store;
use tessera::version::VersionInfo;
use tessera::wal::{Wal, WalSnapshot};
use tokio::net::TcpListener;

/// Peer requests in tests give up quickly.
pub const PEER_TIMEOUT: Duration = Duration::from_millis(500);

/// Find a port nothing listens on.
pub fn find_available_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("Failed to bind to port");
    listener.local_addr().unwrap().port()
}

/// A peer URL on a port nothing listens on.
pub fn unused_peer_url() -> String {
    format!("http://127.0.0.1:{}", find_available_port())
}

/// Test environment that manages a temporary data directory.
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub data_dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let data_dir = temp_dir.path().join("data");
        Self { temp_dir, data_dir }
    }

    /// Configuration for member `name` of `initial_cluster` (`name=url,...`).
    pub fn config(&self, name: &str, initial_cluster: &str, new_cluster: bool) -> ServerConfig {
        let mut cfg = ServerConfig::development(name, &self.data_dir);
        cfg.initial_cluster = initial_cluster.parse().expect("Invalid initial cluster");
        cfg.advertise_peer_urls = cfg
            .initial_cluster
            .get(name)
            .expect("Member missing from initial cluster")
            .to_vec();
        cfg.new_cluster = new_cluster;
        cfg.peer_timeout = PEER_TIMEOUT;
        cfg.unsafe_no_fsync = true;
        cfg
    }

    /// Configuration for a single-member cluster.
    pub fn single_member_config(&self) -> ServerConfig {
        let initial = format!("infra1={}", unused_peer_url());
        self.config("infra1", &initial, true)
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Bind a listener on a free local port and return it with its URL.
pub async fn bind_local() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    (listener, url)
}

/// Serve the peer API for `cluster` on `listener`, reporting `cluster_version`.
pub fn spawn_peer_server(listener: TcpListener, cluster: &RaftCluster, cluster_version: &str) {
    let state = PeerState::from_cluster(
        cluster,
        VersionInfo {
            server: "3.6.0".to_string(),
            cluster: cluster_version.to_string(),
        },
    );
    tokio::spawn(async move {
        let _ = peer::serve(listener, state).await;
    });
}

/// Serve a discovery endpoint that answers every join with `cluster`.
pub fn spawn_discovery_server(listener: TcpListener, cluster: String) {
    let app = Router::new().route(
        "/join",
        post(move || {
            let cluster = cluster.clone();
            async move { Json(serde_json::json!({ "cluster": cluster })) }
        }),
    );
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
}

/// A member with published client URLs.
pub fn started_member(name: &str, peer_url: &str, token: &str) -> Member {
    let mut m = Member::new(name, &[peer_url.to_string()], token);
    m.attributes.client_urls = vec![format!("{}/client", peer_url)];
    m
}

/// Identity written into hand-built logs.
pub fn log_metadata(node_id: u64, cluster_id: u64) -> SnapshotMetadata {
    SnapshotMetadata {
        node_id: Id(node_id),
        cluster_id: Id(cluster_id),
    }
}

/// Create a log for `meta` holding an optional snapshot record, `entries`
/// and a final hard state.
pub fn write_wal(
    cfg: &ServerConfig,
    meta: SnapshotMetadata,
    snapshot: Option<WalSnapshot>,
    state: HardState,
    entries: &[LogEntry],
) {
    let mut w = Wal::create(&cfg.wal_dir(), &meta.encode().unwrap()).unwrap();
    if let Some(snap) = snapshot {
        w.save_snapshot(&snap).unwrap();
    }
    w.save(&state, entries).unwrap();
    w.close().unwrap();
}

/// Write a snapshot file at `index`/`term` whose v2 store is `store`.
pub fn write_snapshot(cfg: &ServerConfig, index: u64, term: u64, voters: Vec<u64>, store: &Store) -> Snapshot {
    std::fs::create_dir_all(cfg.snap_dir()).unwrap();
    let snapshot = Snapshot {
        data: store.save().unwrap(),
        metadata: SnapshotMeta {
            conf_state: ConfState {
                voters,
                learners: vec![],
            },
            index,
            term,
        },
    };
    Snapshotter::new(cfg.snap_dir()).save_snap(&snapshot).unwrap();
    snapshot
}

/// Create the backend with `consistent_index` recorded.
pub fn write_backend(cfg: &ServerConfig, consistent_index: Option<(u64, u64)>) {
    let mut be = Backend::open(cfg.backend_path()).unwrap();
    be.create_meta_bucket().unwrap();
    if let Some((index, term)) = consistent_index {
        be.set_consistent_index(index, term).unwrap();
    }
    update_storage_version(&be).unwrap();
    be.close().unwrap();
}

/// Normal entries at `term` covering `indices`.
pub fn entries(term: u64, indices: std::ops::RangeInclusive<u64>) -> Vec<LogEntry> {
    indices
        .map(|i| LogEntry::new(term, i, format!("put k{}", i).into_bytes()))
        .collect()
}
