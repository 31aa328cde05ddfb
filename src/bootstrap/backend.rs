//! Opening the backend and recovering it from the newest snapshot.

use crate::backend::{self, should_defrag, Backend};
use crate::config::ServerConfig;
use crate::error::{Result, TesseraError};
use crate::raft::Snapshot;
use crate::snap::Snapshotter;
use crate::v2store::{assert_no_v2_store_content, Store};
use crate::wal;
use parking_lot::RwLock;
use std::fs;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// The backend, whether it existed before this start, and the snapshot it was
/// recovered from.
#[derive(Debug)]
pub(super) struct BootstrappedBackend {
    pub backend: Backend,
    pub be_exist: bool,
    pub snapshot: Option<Snapshot>,
    /// Remove the backend directory when bootstrap fails after this point.
    pub remove_on_failure: bool,
}

impl BootstrappedBackend {
    /// Release the backend after a failed bootstrap.
    pub fn close_after_failure(self) {
        let path = self.backend.path().to_path_buf();
        close_quietly(self.backend);
        if self.remove_on_failure {
            if let Err(e) = fs::remove_dir_all(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove backend");
            }
        }
    }
}

fn close_quietly(be: Backend) {
    let path = be.path().to_path_buf();
    if let Err(e) = be.close() {
        warn!(path = %path.display(), error = %e, "Failed to close backend");
    }
}

/// Close `be` and hand back `err`.
fn fail<T>(be: Backend, err: TesseraError) -> Result<T> {
    close_quietly(be);
    Err(err)
}

/// Open the backend and bring it in line with the newest snapshot.
pub(super) fn bootstrap_backend(
    cfg: &ServerConfig,
    have_wal: bool,
    st: &Arc<RwLock<Store>>,
    ss: &Snapshotter,
) -> Result<BootstrappedBackend> {
    let path = cfg.backend_path();
    let be_exist = path.exists();
    let mut be = Backend::open(&path)?;

    if let Err(e) = be.create_meta_bucket() {
        return fail(be, e);
    }
    if cfg.defrag_threshold_mb != 0 && be_exist {
        if let Err(e) = maybe_defrag_backend(cfg, &be) {
            return fail(be, e);
        }
    }
    match be.consistent_index() {
        Ok(ci) => debug!(index = ?ci, "Restore consistent index"),
        Err(e) => return fail(be, e),
    }

    let mut snapshot = None;
    if have_wal {
        let (snap, recovered) = recover_snapshot(cfg, st, be, be_exist, ss)?;
        snapshot = snap;
        be = recovered;
    }

    if be_exist {
        if let Err(e) = backend::validate(&be) {
            error!(error = %e, "Failed to validate schema");
            return fail(be, TesseraError::Fatal(format!("failed to validate schema: {}", e)));
        }
    }

    Ok(BootstrappedBackend {
        backend: be,
        be_exist,
        snapshot,
        remove_on_failure: false,
    })
}

fn maybe_defrag_backend(cfg: &ServerConfig, be: &Backend) -> Result<()> {
    let size = be.size()?;
    let size_in_use = be.size_in_use()?;
    if !should_defrag(size, size_in_use, cfg.defrag_threshold_mb) {
        info!(
            current_db_size_bytes = size,
            current_db_size_in_use_bytes = size_in_use,
            defrag_threshold_bytes = cfg.defrag_threshold_mb.saturating_mul(1024 * 1024),
            "Skipping defragmentation"
        );
        return Ok(());
    }
    be.defrag()
}

/// Find the newest usable snapshot and recover the v2 store and backend from it.
///
/// Takes the backend by value: it may be replaced by the snapshot's database.
/// The backend is closed on every error.
fn recover_snapshot(
    cfg: &ServerConfig,
    st: &Arc<RwLock<Store>>,
    be: Backend,
    be_exist: bool,
    ss: &Snapshotter,
) -> Result<(Option<Snapshot>, Backend)> {
    // Snapshot files can outlive a crash that happened before the log recorded them.
    let wal_snaps = match wal::valid_snapshot_entries(&cfg.wal_dir()) {
        Ok(s) => s,
        Err(e) => return fail(be, e),
    };
    let snapshot = match ss.load_newest_available(&wal_snaps) {
        Ok(s) => s,
        Err(e) => return fail(be, e),
    };

    let Some(snapshot) = snapshot else {
        info!("No snapshot found. Recovering WAL from scratch!");
        return Ok((None, be));
    };

    if let Err(e) = st.write().recovery(&snapshot.data) {
        error!(error = %e, "Failed to recover from snapshot");
        return fail(be, TesseraError::Fatal(format!("failed to recover from snapshot: {}", e)));
    }
    if let Err(e) = assert_no_v2_store_content(&st.read(), cfg.v2_deprecation) {
        error!(error = %e, "Illegal v2store content");
        return fail(be, e);
    }
    info!(
        snapshot_index = snapshot.metadata.index,
        snapshot_size = snapshot.data.len(),
        "Recovered v2 store from snapshot"
    );

    let be = recover_snapshot_backend(cfg, be, &snapshot, ss).map_err(|e| {
        error!(error = %e, "Failed to recover v3 backend from snapshot");
        TesseraError::Fatal(format!("failed to recover v3 backend from snapshot: {}", e))
    })?;
    match (be.size(), be.size_in_use()) {
        (Ok(size), Ok(in_use)) => info!(
            backend_size_bytes = size,
            backend_size_in_use_bytes = in_use,
            "Recovered v3 backend from snapshot"
        ),
        _ => info!("Recovered v3 backend from snapshot"),
    }

    if be_exist {
        let kv_index = match be.consistent_index() {
            Ok(ci) => ci,
            Err(e) => return fail(be, e),
        };
        match kv_index {
            Some(ci) if ci < snapshot.metadata.index => {
                let err = TesseraError::DataCorruption(format!(
                    "database file ({} index {}) does not match with snapshot (index {})",
                    cfg.backend_path().display(),
                    ci,
                    snapshot.metadata.index
                ));
                return fail(be, err);
            }
            None => warn!(
                snapshot_index = snapshot.metadata.index,
                "Consistent index was never saved"
            ),
            Some(_) => {}
        }
    }

    Ok((Some(snapshot), be))
}

/// Keep `be` if it already covers `snapshot`, otherwise swap in the
/// snapshot's database. Closes `be` on error.
fn recover_snapshot_backend(
    cfg: &ServerConfig,
    be: Backend,
    snapshot: &Snapshot,
    ss: &Snapshotter,
) -> Result<Backend> {
    let ci = match be.consistent_index() {
        Ok(ci) => ci,
        Err(e) => return fail(be, e),
    };
    if ci.unwrap_or(0) >= snapshot.metadata.index {
        return Ok(be);
    }
    let ct = match be.consistent_term() {
        Ok(ct) => ct,
        Err(e) => return fail(be, e),
    };

    let path = be.path().to_path_buf();
    be.close()?;

    let snap_db = ss.db_file_path(snapshot.metadata.index);
    if !snap_db.exists() {
        return Err(TesseraError::NotFound(format!(
            "snapshot database {} for index {}",
            snap_db.display(),
            snapshot.metadata.index
        )));
    }
    info!(
        snapshot_db = %snap_db.display(),
        backend = %path.display(),
        consistent_index = ?ci,
        consistent_term = ?ct,
        snapshot_index = snapshot.metadata.index,
        "Replacing backend with snapshot database"
    );
    fs::remove_dir_all(&path)?;
    fs::rename(&snap_db, &path)?;

    let mut be = Backend::open(cfg.backend_path())?;
    if let Err(e) = be.create_meta_bucket() {
        return fail(be, e);
    }
    Ok(be)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{ConfState, SnapshotMeta};
    use crate::wal::{Wal, WalSnapshot};
    use crate::raft::HardState;
    use tempfile::tempdir;

    fn snapshot(index: u64, store: &Store) -> Snapshot {
        Snapshot {
            data: store.save().unwrap(),
            metadata: SnapshotMeta {
                conf_state: ConfState { voters: vec![1], learners: vec![] },
                index,
                term: 2,
            },
        }
    }

    /// A log holding a committed snapshot record at `index`.
    fn write_wal(cfg: &ServerConfig, index: u64) {
        let mut w = Wal::create(&cfg.wal_dir(), b"m").unwrap();
        w.save_snapshot(&WalSnapshot::new(index, 2)).unwrap();
        w.save(&HardState { term: 2, vote: 1, commit: index }, &[]).unwrap();
        w.close().unwrap();
    }

    fn setup(dir: &std::path::Path) -> (ServerConfig, Snapshotter, Arc<RwLock<Store>>) {
        let cfg = ServerConfig::development("a", dir);
        fs::create_dir_all(cfg.snap_dir()).unwrap();
        (cfg.clone(), Snapshotter::new(cfg.snap_dir()), Arc::new(RwLock::new(Store::new())))
    }

    #[test]
    fn test_fresh_backend() {
        let dir = tempdir().unwrap();
        let (cfg, ss, st) = setup(dir.path());

        let bbe = bootstrap_backend(&cfg, false, &st, &ss).unwrap();
        assert!(!bbe.be_exist);
        assert!(bbe.snapshot.is_none());
        assert!(bbe.backend.has_bucket(crate::backend::Bucket::Meta));
    }

    #[test]
    fn test_consistent_index_behind_snapshot_fails() {
        let dir = tempdir().unwrap();
        let (cfg, ss, st) = setup(dir.path());

        let mut be = Backend::open(cfg.backend_path()).unwrap();
        be.create_meta_bucket().unwrap();
        be.set_consistent_index(80, 2).unwrap();
        be.checkpoint(&ss.db_file_path(100)).unwrap();
        be.close().unwrap();

        // The snapshot database is just as stale as the backend
        write_wal(&cfg, 100);
        ss.save_snap(&snapshot(100, &Store::new())).unwrap();

        let err = bootstrap_backend(&cfg, true, &st, &ss).unwrap_err();
        assert!(matches!(err, TesseraError::DataCorruption(_)), "{}", err);
        assert!(err.to_string().contains("does not match with snapshot"));
    }

    #[test]
    fn test_unrecorded_index_only_warns() {
        let dir = tempdir().unwrap();
        let (cfg, ss, st) = setup(dir.path());

        let mut be = Backend::open(cfg.backend_path()).unwrap();
        be.create_meta_bucket().unwrap();
        be.checkpoint(&ss.db_file_path(100)).unwrap();
        be.close().unwrap();

        write_wal(&cfg, 100);
        ss.save_snap(&snapshot(100, &Store::new())).unwrap();

        let bbe = bootstrap_backend(&cfg, true, &st, &ss).unwrap();
        assert_eq!(bbe.snapshot.unwrap().metadata.index, 100);
        assert_eq!(bbe.backend.consistent_index().unwrap(), None);
    }

    #[test]
    fn test_backend_replaced_by_snapshot_db() {
        let dir = tempdir().unwrap();
        let (cfg, ss, st) = setup(dir.path());

        // Snapshot database ahead of the live backend
        let mut newer = Backend::open(dir.path().join("newer")).unwrap();
        newer.create_meta_bucket().unwrap();
        newer.set_consistent_index(100, 2).unwrap();
        newer.checkpoint(&ss.db_file_path(100)).unwrap();
        newer.close().unwrap();

        let mut be = Backend::open(cfg.backend_path()).unwrap();
        be.create_meta_bucket().unwrap();
        be.set_consistent_index(40, 1).unwrap();
        be.close().unwrap();

        write_wal(&cfg, 100);
        ss.save_snap(&snapshot(100, &Store::new())).unwrap();

        let bbe = bootstrap_backend(&cfg, true, &st, &ss).unwrap();
        assert_eq!(bbe.backend.consistent_index().unwrap(), Some(100));
        assert!(!ss.db_file_path(100).exists());
    }

    #[test]
    fn test_v2_user_content_rejected() {
        let dir = tempdir().unwrap();
        let (cfg, ss, st) = setup(dir.path());

        let mut user = Store::new();
        user.set("/1/foo", "bar").unwrap();
        write_wal(&cfg, 100);
        ss.save_snap(&snapshot(100, &user)).unwrap();

        let err = bootstrap_backend(&cfg, true, &st, &ss).unwrap_err();
        assert!(err.to_string().contains("disallowed custom content"));
    }

    #[test]
    fn test_defrag_only_for_existing_backend() {
        let dir = tempdir().unwrap();
        let (mut cfg, ss, st) = setup(dir.path());
        cfg.defrag_threshold_mb = 1;

        let bbe = bootstrap_backend(&cfg, false, &st, &ss).unwrap();
        bbe.backend.close().unwrap();

        let bbe = bootstrap_backend(&cfg, false, &st, &ss).unwrap();
        assert!(bbe.be_exist);
    }
}
