//! Restarting from an existing log: snapshot recovery, forced single-member
//! recovery, torn-tail repair and the backend checks around them.

#[allow(dead_code)]
mod common;

use common::*;
use std::fs::{self, OpenOptions};
use std::io::Write;
use tessera::backend::{Backend, Bucket};
use tessera::membership::{Member, RaftCluster};
use tessera::raft::{ConfChange, ConfChangeType, HardState, LogEntry};
use tessera::snap::Snapshotter;
use tessera::v2store::Store;
use tessera::version::Version;
use tessera::wal::{encode_frame, WalRecord, WalSnapshot};
use tessera::{bootstrap, BootstrapPath, TesseraError};

const NODE: u64 = 0x1a;
const CLUSTER: u64 = 0xc0;

fn hard_state(term: u64, commit: u64) -> HardState {
    HardState {
        term,
        vote: NODE,
        commit,
    }
}

/// Snapshot at 100 (term 5), entries 101..=105 and a backend at index 100.
fn write_snapshotted_member(env: &TestEnv, voters: Vec<u64>, commit: u64) -> tessera::config::ServerConfig {
    let cfg = env.single_member_config();
    write_snapshot(&cfg, 100, 5, voters, &Store::new());
    write_wal(
        &cfg,
        log_metadata(NODE, CLUSTER),
        Some(WalSnapshot::new(100, 5)),
        hard_state(5, commit),
        &entries(5, 101..=105),
    );
    write_backend(&cfg, Some((100, 5)));
    cfg
}

fn segment_path(cfg: &tessera::config::ServerConfig) -> std::path::PathBuf {
    cfg.wal_dir().join(format!("{:016x}-{:016x}.wal", 0, 0))
}

#[tokio::test]
async fn test_restart_from_snapshot_and_log() {
    let env = TestEnv::new();
    let cfg = write_snapshotted_member(&env, vec![NODE], 105);

    let server = bootstrap(&cfg).await.unwrap();

    assert_eq!(
        server.path,
        BootstrapPath::RestartFromLog {
            meta: log_metadata(NODE, CLUSTER)
        }
    );
    assert_eq!(server.node_id().0, NODE);
    assert_eq!(server.cluster_id().0, CLUSTER);
    assert!(server.be_exist);

    let status = server.status().unwrap();
    assert_eq!(status.hard_state.commit, 105);
    assert_eq!(status.applied, 100);
    assert_eq!(status.voters, vec![NODE]);

    let storage = server.node.storage();
    assert_eq!(storage.read().first_index(), 101);
    assert_eq!(storage.read().last_index(), 105);
    assert_eq!(server.wal.last_index(), 105);
    server.close().unwrap();
}

#[tokio::test]
async fn test_restart_is_repeatable() {
    let env = TestEnv::new();
    let cfg = write_snapshotted_member(&env, vec![NODE], 105);

    let first = bootstrap(&cfg).await.unwrap();
    let first_storage = first.node.storage().read().clone();
    let first_status = first.status().unwrap();
    first.close().unwrap();

    let second = bootstrap(&cfg).await.unwrap();
    assert!(matches!(second.path, BootstrapPath::RestartFromLog { .. }));
    let second_storage = second.node.storage().read().clone();
    let second_status = second.status().unwrap();
    second.close().unwrap();

    assert_eq!(first_storage, second_storage);
    assert_eq!(first_status.hard_state, second_status.hard_state);
    assert_eq!(first_storage.snapshot().metadata.index, 100);
    assert_eq!(second_storage.entries(101, 106).unwrap().len(), 5);
}

#[tokio::test]
async fn test_forced_recovery_reduces_to_single_member() {
    let env = TestEnv::new();
    let mut cfg = write_snapshotted_member(&env, vec![NODE, 0x2b, 0x3c], 102);
    cfg.force_new_cluster = true;

    let server = bootstrap(&cfg).await.unwrap();

    // 103..105 were never committed; the two removals take their place.
    let status = server.status().unwrap();
    assert_eq!(status.voters, vec![NODE]);
    assert_eq!(status.hard_state.commit, 104);

    let storage = server.node.storage();
    let tail = storage.read().entries(103, 105).unwrap();
    let removed: Vec<u64> = tail
        .iter()
        .map(|e| e.as_conf_change().unwrap().unwrap())
        .inspect(|cc| assert_eq!(cc.change_type, ConfChangeType::RemoveNode))
        .map(|cc| cc.node_id)
        .collect();
    assert_eq!(removed, vec![0x2b, 0x3c]);
    assert!(tail.iter().all(|e| e.term == 5));
    server.close().unwrap();
}

#[tokio::test]
async fn test_forced_recovery_adds_missing_self() {
    let env = TestEnv::new();
    let mut cfg = write_snapshotted_member(&env, vec![0x2b], 105);
    cfg.force_new_cluster = true;

    let server = bootstrap(&cfg).await.unwrap();

    let status = server.status().unwrap();
    assert_eq!(status.voters, vec![NODE]);
    assert_eq!(status.hard_state.commit, 107);

    let storage = server.node.storage();
    let added = storage.read().get(106).unwrap().as_conf_change().unwrap().unwrap();
    assert_eq!(added.change_type, ConfChangeType::AddNode);
    assert_eq!(added.node_id, NODE);
    server.close().unwrap();
}

#[tokio::test]
async fn test_backend_behind_snapshot_is_fatal_and_closed() {
    let env = TestEnv::new();
    let cfg = env.single_member_config();
    write_snapshot(&cfg, 100, 5, vec![NODE], &Store::new());
    write_wal(
        &cfg,
        log_metadata(NODE, CLUSTER),
        Some(WalSnapshot::new(100, 5)),
        hard_state(5, 100),
        &[],
    );
    write_backend(&cfg, Some((40, 3)));

    let err = bootstrap(&cfg).await.unwrap_err();
    assert!(err.is_fatal(), "got {err}");

    // Nothing holds the backend open any more.
    Backend::open(cfg.backend_path()).unwrap().close().unwrap();
}

#[tokio::test]
async fn test_backend_replaced_by_snapshot_database() {
    let env = TestEnv::new();
    let cfg = env.single_member_config();
    write_snapshot(&cfg, 100, 5, vec![NODE], &Store::new());
    write_wal(
        &cfg,
        log_metadata(NODE, CLUSTER),
        Some(WalSnapshot::new(100, 5)),
        hard_state(5, 100),
        &[],
    );
    write_backend(&cfg, Some((40, 3)));

    let mut src = Backend::open(env.temp_dir.path().join("src-db")).unwrap();
    src.create_meta_bucket().unwrap();
    src.set_consistent_index(100, 5).unwrap();
    tessera::backend::update_storage_version(&src).unwrap();
    Snapshotter::new(cfg.snap_dir()).save_db(&src, 100).unwrap();
    src.close().unwrap();

    let server = bootstrap(&cfg).await.unwrap();
    assert_eq!(server.backend.consistent_index().unwrap(), Some(100));
    assert!(!Snapshotter::new(cfg.snap_dir()).db_file_path(100).exists());
    server.close().unwrap();
}

#[tokio::test]
async fn test_missing_v3_backend_is_removed() {
    let env = TestEnv::new();
    let cfg = env.single_member_config();
    write_snapshot(&cfg, 100, 5, vec![NODE], &Store::new());
    write_wal(
        &cfg,
        log_metadata(NODE, CLUSTER),
        Some(WalSnapshot::new(100, 5)),
        hard_state(5, 100),
        &[],
    );

    // Only the snapshot database survived, and it records a v3 cluster.
    let mut src = Backend::open(env.temp_dir.path().join("src-db")).unwrap();
    let mut cluster = RaftCluster::new();
    cluster.bind_backend(&mut src).unwrap();
    cluster
        .add_member(Member::new("infra1", &[unused_peer_url()], "t"), Some(&src))
        .unwrap();
    cluster.set_version(Version::new(3, 5, 0), Some(&src)).unwrap();
    src.set_consistent_index(100, 5).unwrap();
    Snapshotter::new(cfg.snap_dir()).save_db(&src, 100).unwrap();
    src.close().unwrap();

    let err = bootstrap(&cfg).await.unwrap_err();
    assert!(matches!(err, TesseraError::DataCorruption(_)), "got {err}");
    assert!(!cfg.backend_path().exists());
}

#[tokio::test]
async fn test_torn_tail_is_repaired_once() {
    let env = TestEnv::new();
    let cfg = env.single_member_config();
    let add = ConfChange::new(ConfChangeType::AddNode, NODE, Vec::new());
    let mut log = vec![LogEntry::conf_change(1, 1, &add).unwrap()];
    log.extend(entries(1, 2..=3));
    write_wal(&cfg, log_metadata(NODE, CLUSTER), None, hard_state(1, 3), &log);

    // A write cut short after its header.
    let frame = encode_frame(&WalRecord::Entry(LogEntry::new(1, 4, b"lost".to_vec()))).unwrap();
    let segment = segment_path(&cfg);
    let intact_len = fs::metadata(&segment).unwrap().len();
    let mut file = OpenOptions::new().append(true).open(&segment).unwrap();
    file.write_all(&frame[..frame.len() - 3]).unwrap();
    drop(file);

    let server = bootstrap(&cfg).await.unwrap();
    let status = server.status().unwrap();
    assert_eq!(status.hard_state.commit, 3);
    assert_eq!(status.voters, vec![NODE]);
    assert_eq!(server.node.storage().read().last_index(), 3);
    server.close().unwrap();

    assert_eq!(fs::metadata(&segment).unwrap().len(), intact_len);
    let broken = cfg.wal_dir().join(format!("{:016x}-{:016x}.wal.broken", 0, 0));
    assert!(broken.exists());
}

#[tokio::test]
async fn test_checksum_damage_is_not_repaired() {
    let env = TestEnv::new();
    let cfg = env.single_member_config();
    write_wal(&cfg, log_metadata(NODE, CLUSTER), None, hard_state(1, 3), &entries(1, 1..=3));

    let mut frame = encode_frame(&WalRecord::Entry(LogEntry::new(1, 4, b"flip".to_vec()))).unwrap();
    let last = frame.len() - 1;
    frame[last] ^= 0xff;
    let segment = segment_path(&cfg);
    let mut file = OpenOptions::new().append(true).open(&segment).unwrap();
    file.write_all(&frame).unwrap();
    drop(file);

    assert!(bootstrap(&cfg).await.is_err());
    let broken = cfg.wal_dir().join(format!("{:016x}-{:016x}.wal.broken", 0, 0));
    assert!(!broken.exists());
}

#[tokio::test]
async fn test_corrupt_and_orphan_snapshots_are_skipped() {
    let env = TestEnv::new();
    let cfg = env.single_member_config();
    write_snapshot(&cfg, 100, 5, vec![NODE], &Store::new());

    // Index 105 is recorded by the log but its file is damaged; index 300 has
    // no log record at all.
    let snap_105 = cfg.snap_dir().join(format!("{:016x}-{:016x}.snap", 5, 105));
    fs::write(&snap_105, b"garbage").unwrap();
    write_snapshot(&cfg, 300, 6, vec![NODE], &Store::new());

    let mut w = tessera::wal::Wal::create(&cfg.wal_dir(), &log_metadata(NODE, CLUSTER).encode().unwrap()).unwrap();
    w.save_snapshot(&WalSnapshot::new(100, 5)).unwrap();
    w.save(&hard_state(5, 105), &entries(5, 101..=105)).unwrap();
    w.save_snapshot(&WalSnapshot::new(105, 5)).unwrap();
    w.close().unwrap();
    write_backend(&cfg, Some((100, 5)));

    let server = bootstrap(&cfg).await.unwrap();
    assert_eq!(server.status().unwrap().applied, 100);
    server.close().unwrap();

    let mut broken = snap_105.into_os_string();
    broken.push(".broken");
    assert!(std::path::Path::new(&broken).exists());
    assert!(cfg
        .snap_dir()
        .join(format!("{:016x}-{:016x}.snap", 6, 300))
        .exists());
}

#[tokio::test]
async fn test_user_data_in_v2_snapshot_is_rejected() {
    let env = TestEnv::new();
    let cfg = env.single_member_config();
    let mut store = Store::new();
    store.set("/1/foo", "bar").unwrap();
    write_snapshot(&cfg, 100, 5, vec![NODE], &store);
    write_wal(
        &cfg,
        log_metadata(NODE, CLUSTER),
        Some(WalSnapshot::new(100, 5)),
        hard_state(5, 100),
        &[],
    );
    write_backend(&cfg, Some((100, 5)));

    let err = bootstrap(&cfg).await.unwrap_err();
    assert!(matches!(err, TesseraError::Config(_)), "got {err}");
}

#[tokio::test]
async fn test_restart_ignores_discovery() {
    let env = TestEnv::new();
    let mut cfg = env.single_member_config();
    bootstrap(&cfg).await.unwrap().close().unwrap();

    cfg.discovery_url = Some(unused_peer_url());
    let server = bootstrap(&cfg).await.unwrap();
    assert!(matches!(server.path, BootstrapPath::RestartFromLog { .. }));
    server.close().unwrap();

    let be = Backend::open(cfg.backend_path()).unwrap();
    assert!(be.has_bucket(Bucket::Members));
    be.close().unwrap();
}
