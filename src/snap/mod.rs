//! Snapshot files.
//!
//! A snapshot is stored as `{term:016x}-{index:016x}.snap`, laid out as
//! `[u32 crc32 BE][bincode Snapshot]`. The backend database matching a
//! snapshot is kept beside it as `{index:016x}.snap.db`.

use crate::backend::Backend;
use crate::error::{Result, TesseraError};
use crate::raft::Snapshot;
use crate::types::{LogIndex, Term};
use crate::wal::WalSnapshot;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const SNAP_SUFFIX: &str = ".snap";
const SNAP_DB_SUFFIX: &str = ".snap.db";
const BROKEN_SUFFIX: &str = ".broken";

/// Reads and writes snapshot files in one directory.
#[derive(Debug, Clone)]
pub struct Snapshotter {
    dir: PathBuf,
}

impl Snapshotter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `snapshot` to its file. Empty snapshots are not written.
    pub fn save_snap(&self, snapshot: &Snapshot) -> Result<()> {
        if snapshot.is_empty() {
            return Ok(());
        }

        let bytes = bincode::serialize(snapshot)?;
        let crc = crc32fast::hash(&bytes);
        let name = snap_name(snapshot.metadata.term, snapshot.metadata.index);
        let path = self.dir.join(&name);

        let mut file = File::create(&path)?;
        file.write_all(&crc.to_be_bytes())?;
        file.write_all(&bytes)?;
        file.sync_all()?;

        debug!(
            path = %path.display(),
            index = snapshot.metadata.index,
            term = snapshot.metadata.term,
            "Saved snapshot"
        );
        Ok(())
    }

    /// Load the newest snapshot that the log also records.
    ///
    /// Files are tried newest first. Files matching no entry in `valid`, or
    /// whose decoded metadata differs from their name, are skipped; files that fail to load are renamed with a `.broken` suffix.
    /// Returns `None` when nothing usable is found.
    pub fn load_newest_available(&self, valid: &[WalSnapshot]) -> Result<Option<Snapshot>> {
        for name in self.snap_names()? {
            let Some((term, index)) = parse_snap_name(&name) else {
                continue;
            };
            if !valid.iter().any(|w| w.term == term && w.index == index) {
                debug!(file = %name, "Skipping snapshot with no matching log record");
                continue;
            }

            let path = self.dir.join(&name);
            match read_snap(&path) {
                Ok(snapshot)
                    if snapshot.metadata.term != term || snapshot.metadata.index != index =>
                {
                    warn!(
                        file = %name,
                        snapshot_term = snapshot.metadata.term,
                        snapshot_index = snapshot.metadata.index,
                        "Skipping snapshot whose content disagrees with its name"
                    );
                }
                Ok(snapshot) => {
                    info!(file = %name, index, term, "Loaded snapshot");
                    return Ok(Some(snapshot));
                }
                Err(e) => {
                    warn!(file = %name, error = %e, "Failed to load snapshot");
                    rename_broken(&path);
                }
            }
        }
        Ok(None)
    }

    /// Snapshot file names, newest first.
    pub fn snap_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if parse_snap_name(&name).is_some() {
                names.push(name);
            }
        }
        names.sort_unstable_by(|a, b| b.cmp(a));
        Ok(names)
    }

    /// Path of the backend database saved alongside the snapshot at `index`.
    pub fn db_file_path(&self, index: LogIndex) -> PathBuf {
        self.dir.join(format!("{:016x}{}", index, SNAP_DB_SUFFIX))
    }

    /// Checkpoint `backend` as the database for the snapshot at `index`.
    pub fn save_db(&self, backend: &Backend, index: LogIndex) -> Result<PathBuf> {
        let dest = self.db_file_path(index);
        let tmp = self.dir.join(format!("tmp{:016x}", index));
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }

        backend.checkpoint(&tmp)?;
        if dest.exists() {
            fs::remove_dir_all(&dest)?;
        }
        fs::rename(&tmp, &dest)?;

        info!(path = %dest.display(), index, "Saved snapshot database");
        Ok(dest)
    }
}

fn snap_name(term: Term, index: LogIndex) -> String {
    format!("{:016x}-{:016x}{}", term, index, SNAP_SUFFIX)
}

fn parse_snap_name(name: &str) -> Option<(Term, LogIndex)> {
    let stem = name.strip_suffix(SNAP_SUFFIX)?;
    let (term, index) = stem.split_once('-')?;
    if term.len() != 16 || index.len() != 16 {
        return None;
    }
    Some((
        u64::from_str_radix(term, 16).ok()?,
        u64::from_str_radix(index, 16).ok()?,
    ))
}

fn read_snap(path: &Path) -> Result<Snapshot> {
    let data = fs::read(path)?;
    if data.len() < 4 {
        return Err(TesseraError::Snapshot(format!(
            "{} is too short to hold a snapshot",
            path.display()
        )));
    }

    let stored = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let body = &data[4..];
    let computed = crc32fast::hash(body);
    if stored != computed {
        return Err(TesseraError::ChecksumMismatch {
            expected: stored,
            actual: computed,
        });
    }

    let snapshot: Snapshot = bincode::deserialize(body)
        .map_err(|e| TesseraError::Snapshot(format!("{}: {}", path.display(), e)))?;
    if snapshot.is_empty() {
        return Err(TesseraError::Snapshot(format!(
            "{} holds an empty snapshot",
            path.display()
        )));
    }
    Ok(snapshot)
}

fn rename_broken(path: &Path) {
    let mut broken = path.as_os_str().to_os_string();
    broken.push(BROKEN_SUFFIX);
    if let Err(e) = fs::rename(path, &broken) {
        warn!(path = %path.display(), error = %e, "Failed to rename broken snapshot");
    }
}
