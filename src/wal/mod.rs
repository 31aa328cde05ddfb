//! Durable write-ahead log.
//!
//! The log lives in a directory of segment files named
//! `{seq:016x}-{index:016x}.wal`, where `index` is the first log index the
//! segment may hold. A log is created with a metadata record and an empty
//! snapshot record, so it can always be opened at position zero.
//!
//! Opening is a two-step affair: [`Wal::open`] positions the log at a snapshot,
//! then [`Wal::read_all`] replays every record after it and leaves the tail
//! segment open for appends.

mod record;

pub use record::{encode_frame, FrameReader, WalRecord, WalSnapshot, FRAME_HEADER_SIZE};

use crate::error::{Result, TesseraError};
use crate::raft::{HardState, LogEntry};
use crate::types::LogIndex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const SEGMENT_SUFFIX: &str = ".wal";

/// An open write-ahead log.
#[derive(Debug)]
pub struct Wal {
    dir: PathBuf,
    /// Snapshot the log was opened at; `read_all` returns entries after it.
    start: WalSnapshot,
    /// Segments to replay, oldest first.
    segments: Vec<PathBuf>,
    metadata: Vec<u8>,
    state: HardState,
    last_index: LogIndex,
    /// Tail segment, present once the log is ready for appends.
    tail: Option<File>,
    unsafe_no_fsync: bool,
}

/// Whether `dir` holds a log.
pub fn exist(dir: &Path) -> bool {
    segment_names(dir).map(|n| !n.is_empty()).unwrap_or(false)
}

impl Wal {
    /// Create a new log in `dir` holding `metadata`.
    ///
    /// The log is assembled in a sibling temp directory and renamed into place,
    /// so a crash never leaves a half-initialized log behind.
    pub fn create(dir: &Path, metadata: &[u8]) -> Result<Self> {
        if exist(dir) {
            return Err(TesseraError::AlreadyExists(format!(
                "wal already exists in {}",
                dir.display()
            )));
        }

        let parent = dir.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;

        let tmp = tmp_dir_path(dir);
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }
        fs::create_dir_all(&tmp)?;

        let name = segment_name(0, 0);
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(tmp.join(&name))?;
            file.write_all(&encode_frame(&WalRecord::Metadata(metadata.to_vec()))?)?;
            file.write_all(&encode_frame(&WalRecord::Snapshot(WalSnapshot::default()))?)?;
            file.sync_all()?;
        }

        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        fs::rename(&tmp, dir)?;
        sync_dir(parent)?;

        let tail_path = dir.join(&name);
        let tail = OpenOptions::new().append(true).open(&tail_path)?;

        info!(dir = %dir.display(), "Created WAL");

        Ok(Self {
            dir: dir.to_path_buf(),
            start: WalSnapshot::default(),
            segments: vec![tail_path],
            metadata: metadata.to_vec(),
            state: HardState::default(),
            last_index: 0,
            tail: Some(tail),
            unsafe_no_fsync: false,
        })
    }

    /// Open the log positioned at `snap`. Call [`Wal::read_all`] next.
    pub fn open(dir: &Path, snap: WalSnapshot) -> Result<Self> {
        let names = segment_names(dir)?;
        if names.is_empty() {
            return Err(TesseraError::NotFound(format!(
                "wal: no segment files in {}",
                dir.display()
            )));
        }

        let start = search_index(&names, snap.index).ok_or_else(|| {
            TesseraError::NotFound(format!(
                "wal: no segment covers index {} in {}",
                snap.index,
                dir.display()
            ))
        })?;
        check_sequence(&names[start..])?;

        debug!(dir = %dir.display(), index = snap.index, term = snap.term, "Opened WAL");

        Ok(Self {
            dir: dir.to_path_buf(),
            last_index: snap.index,
            start: snap,
            segments: names[start..].iter().map(|n| dir.join(n)).collect(),
            metadata: Vec::new(),
            state: HardState::default(),
            tail: None,
            unsafe_no_fsync: false,
        })
    }

    /// Replay the log from the opening snapshot.
    ///
    /// Returns the metadata, the last hard state and the entries after the
    /// snapshot. A later entry at an existing index replaces the earlier one
    /// and everything after it. The tail segment is then opened for appends.
    pub fn read_all(&mut self) -> Result<(Vec<u8>, HardState, Vec<LogEntry>)> {
        let mut metadata: Option<Vec<u8>> = None;
        let mut state = HardState::default();
        let mut entries: Vec<LogEntry> = Vec::new();
        let mut matched = false;
        let mut tail_end = 0;

        for path in &self.segments {
            let mut reader = FrameReader::new(BufReader::new(File::open(path)?));
            while let Some(record) = reader.next_record()? {
                match record {
                    WalRecord::Entry(entry) => {
                        if entry.index > self.start.index {
                            let offset = (entry.index - self.start.index - 1) as usize;
                            if offset > entries.len() {
                                return Err(TesseraError::DataCorruption(format!(
                                    "wal: entry {} leaves a gap after index {}",
                                    entry.index,
                                    self.start.index + entries.len() as u64
                                )));
                            }
                            entries.truncate(offset);
                            self.last_index = entry.index;
                            entries.push(entry);
                        }
                    }
                    WalRecord::State(hs) => state = hs,
                    WalRecord::Metadata(m) => {
                        if metadata.as_ref().is_some_and(|existing| *existing != m) {
                            return Err(TesseraError::DataCorruption(
                                "wal: conflicting metadata found".to_string(),
                            ));
                        }
                        metadata = Some(m);
                    }
                    WalRecord::Snapshot(snap) => {
                        if snap.index == self.start.index {
                            if snap.term != self.start.term {
                                return Err(TesseraError::DataCorruption(format!(
                                    "wal: snapshot at index {} has term {}, expected {}",
                                    snap.index, snap.term, self.start.term
                                )));
                            }
                            matched = true;
                        }
                    }
                }
            }
            tail_end = reader.offset();
        }

        if !matched {
            return Err(TesseraError::NotFound(format!(
                "wal: snapshot {{index: {}, term: {}}} not found",
                self.start.index, self.start.term
            )));
        }

        let tail_path = self
            .segments
            .last()
            .ok_or_else(|| TesseraError::Wal("no segments to append to".to_string()))?;
        let tail = OpenOptions::new().write(true).open(tail_path)?;
        tail.set_len(tail_end)?;
        let tail = OpenOptions::new().append(true).open(tail_path)?;
        self.tail = Some(tail);

        let metadata = metadata.unwrap_or_default();
        self.metadata = metadata.clone();
        self.state = state;
        Ok((metadata, state, entries))
    }

    /// Append entries and, when non-empty, a hard state.
    pub fn save(&mut self, state: &HardState, entries: &[LogEntry]) -> Result<()> {
        if state.is_empty() && entries.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        for entry in entries {
            buf.extend_from_slice(&encode_frame(&WalRecord::Entry(entry.clone()))?);
        }
        if !state.is_empty() {
            buf.extend_from_slice(&encode_frame(&WalRecord::State(*state))?);
        }

        self.write_tail(&buf)?;
        if let Some(last) = entries.last() {
            self.last_index = last.index;
        }
        if !state.is_empty() {
            self.state = *state;
        }
        Ok(())
    }

    /// Record that a snapshot was taken at `snap`.
    pub fn save_snapshot(&mut self, snap: &WalSnapshot) -> Result<()> {
        let buf = encode_frame(&WalRecord::Snapshot(snap.clone()))?;
        self.write_tail(&buf)?;
        if self.last_index < snap.index {
            self.last_index = snap.index;
        }
        Ok(())
    }

    fn write_tail(&mut self, buf: &[u8]) -> Result<()> {
        let tail = self
            .tail
            .as_mut()
            .ok_or_else(|| TesseraError::Wal("log must be read before appending".to_string()))?;
        tail.write_all(buf)?;
        if !self.unsafe_no_fsync {
            tail.sync_data()?;
        }
        Ok(())
    }

    /// Disable fsync on appends. Only for tests and throwaway clusters.
    pub fn set_unsafe_no_fsync(&mut self) {
        self.unsafe_no_fsync = true;
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata(&self) -> &[u8] {
        &self.metadata
    }

    pub fn hard_state(&self) -> HardState {
        self.state
    }

    pub fn last_index(&self) -> LogIndex {
        self.last_index
    }

    /// Flush and release the log.
    pub fn close(mut self) -> Result<()> {
        if let Some(tail) = self.tail.take() {
            tail.sync_all()?;
        }
        debug!(dir = %self.dir.display(), "Closed WAL");
        Ok(())
    }
}

/// Truncate a torn record at the end of the last segment.
///
/// The damaged segment is first copied to `<name>.broken`. Returns `true` when
/// the log is readable afterwards, `false` when the damage is not a torn tail.
pub fn repair(dir: &Path) -> bool {
    match repair_tail(dir) {
        Ok(repaired) => repaired,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Failed to repair WAL");
            false
        }
    }
}

fn repair_tail(dir: &Path) -> Result<bool> {
    let names = segment_names(dir)?;
    let Some(last) = names.last() else {
        return Ok(false);
    };
    let path = dir.join(last);

    let mut reader = FrameReader::new(BufReader::new(File::open(&path)?));
    loop {
        match reader.next_record() {
            Ok(Some(_)) => continue,
            Ok(None) => return Ok(true),
            Err(e) if e.is_unexpected_eof() => {
                let broken = dir.join(format!("{}.broken", last));
                fs::copy(&path, &broken)?;

                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(reader.offset())?;
                file.sync_all()?;
                sync_dir(dir)?;

                info!(
                    segment = %path.display(),
                    backup = %broken.display(),
                    offset = reader.offset(),
                    "Repaired WAL tail"
                );
                return Ok(true);
            }
            Err(e) => {
                warn!(segment = %path.display(), error = %e, "WAL damage is not a torn tail");
                return Ok(false);
            }
        }
    }
}

/// Snapshot records whose index is covered by the last recorded commit.
///
/// A snapshot record can land in the log before the state that commits it;
/// such records are not valid restart points. A torn tail is tolerated here.
pub fn valid_snapshot_entries(dir: &Path) -> Result<Vec<WalSnapshot>> {
    let mut snaps = Vec::new();
    let mut state = HardState::default();

    for name in segment_names(dir)? {
        let mut reader = FrameReader::new(BufReader::new(File::open(dir.join(&name))?));
        loop {
            match reader.next_record() {
                Ok(Some(WalRecord::Snapshot(snap))) => snaps.push(snap),
                Ok(Some(WalRecord::State(hs))) => state = hs,
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) if e.is_unexpected_eof() => break,
                Err(e) => return Err(e),
            }
        }
    }

    snaps.retain(|s| s.index <= state.commit);
    Ok(snaps)
}

fn segment_name(seq: u64, index: LogIndex) -> String {
    format!("{:016x}-{:016x}{}", seq, index, SEGMENT_SUFFIX)
}

fn parse_segment_name(name: &str) -> Option<(u64, LogIndex)> {
    let stem = name.strip_suffix(SEGMENT_SUFFIX)?;
    let (seq, index) = stem.split_once('-')?;
    Some((
        u64::from_str_radix(seq, 16).ok()?,
        u64::from_str_radix(index, 16).ok()?,
    ))
}

/// Segment file names in `dir`, in sequence order.
fn segment_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if parse_segment_name(&name).is_some() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Position of the last segment whose first index is at or below `index`.
fn search_index(names: &[String], index: LogIndex) -> Option<usize> {
    names
        .iter()
        .rposition(|n| parse_segment_name(n).is_some_and(|(_, start)| start <= index))
}

fn check_sequence(names: &[String]) -> Result<()> {
    let mut expected: Option<u64> = None;
    for name in names {
        let Some((seq, _)) = parse_segment_name(name) else {
            continue;
        };
        if let Some(want) = expected {
            if seq != want {
                return Err(TesseraError::DataCorruption(format!(
                    "wal: segment {} out of sequence, expected seq {:016x}",
                    name, want
                )));
            }
        }
        expected = Some(seq + 1);
    }
    Ok(())
}

fn tmp_dir_path(dir: &Path) -> PathBuf {
    let mut name = dir
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    dir.with_file_name(name)
}

fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ents(term: u64, range: std::ops::RangeInclusive<LogIndex>) -> Vec<LogEntry> {
        range.map(|i| LogEntry::new(term, i, vec![i as u8])).collect()
    }

    fn segment_path(dir: &Path) -> PathBuf {
        dir.join(segment_name(0, 0))
    }

    #[test]
    fn test_create_then_read_empty() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("wal");

        let wal = Wal::create(&dir, b"metadata").unwrap();
        wal.close().unwrap();
        assert!(exist(&dir));
        assert!(!tmp.path().join("wal.tmp").exists());

        let mut wal = Wal::open(&dir, WalSnapshot::default()).unwrap();
        let (metadata, state, entries) = wal.read_all().unwrap();
        assert_eq!(metadata, b"metadata");
        assert!(state.is_empty());
        assert!(entries.is_empty());
    }

    #[test]
    fn test_create_refuses_existing_log() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("wal");
        Wal::create(&dir, b"a").unwrap().close().unwrap();
        assert!(matches!(Wal::create(&dir, b"b"), Err(TesseraError::AlreadyExists(_))));
    }

    #[test]
    fn test_save_and_replay() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("wal");

        let mut wal = Wal::create(&dir, b"m").unwrap();
        wal.save(&HardState { term: 1, vote: 1, commit: 3 }, &ents(1, 1..=3)).unwrap();
        wal.close().unwrap();

        let mut wal = Wal::open(&dir, WalSnapshot::default()).unwrap();
        let (_, state, entries) = wal.read_all().unwrap();
        assert_eq!(state.commit, 3);
        assert_eq!(entries.len(), 3);
        assert_eq!(wal.last_index(), 3);

        // Appends continue after a read
        wal.save(&HardState { term: 2, vote: 1, commit: 4 }, &ents(2, 4..=4)).unwrap();
        wal.close().unwrap();

        let mut wal = Wal::open(&dir, WalSnapshot::default()).unwrap();
        let (_, state, entries) = wal.read_all().unwrap();
        assert_eq!(state.term, 2);
        assert_eq!(entries.last().unwrap().index, 4);
    }

    #[test]
    fn test_overwritten_entries_replace_suffix() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("wal");

        let mut wal = Wal::create(&dir, b"m").unwrap();
        wal.save(&HardState::default(), &ents(1, 1..=5)).unwrap();
        wal.save(&HardState::default(), &ents(2, 3..=3)).unwrap();
        wal.close().unwrap();

        let mut wal = Wal::open(&dir, WalSnapshot::default()).unwrap();
        let (_, _, entries) = wal.read_all().unwrap();
        assert_eq!(entries.iter().map(|e| e.index).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(entries[2].term, 2);
    }

    #[test]
    fn test_open_at_snapshot_skips_covered_entries() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("wal");

        let mut wal = Wal::create(&dir, b"m").unwrap();
        wal.save(&HardState::default(), &ents(1, 1..=10)).unwrap();
        wal.save_snapshot(&WalSnapshot::new(8, 1)).unwrap();
        wal.save(&HardState { term: 1, vote: 0, commit: 10 }, &[]).unwrap();
        wal.close().unwrap();

        let mut wal = Wal::open(&dir, WalSnapshot::new(8, 1)).unwrap();
        let (_, _, entries) = wal.read_all().unwrap();
        assert_eq!(entries.iter().map(|e| e.index).collect::<Vec<_>>(), vec![9, 10]);

        let mut wal = Wal::open(&dir, WalSnapshot::new(8, 7)).unwrap();
        assert!(matches!(wal.read_all(), Err(TesseraError::DataCorruption(_))));

        let mut wal = Wal::open(&dir, WalSnapshot::new(9, 1)).unwrap();
        assert!(matches!(wal.read_all(), Err(TesseraError::NotFound(_))));
    }

    #[test]
    fn test_valid_snapshot_entries_respects_commit() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("wal");

        let mut wal = Wal::create(&dir, b"m").unwrap();
        wal.save(&HardState::default(), &ents(1, 1..=10)).unwrap();
        wal.save_snapshot(&WalSnapshot::new(5, 1)).unwrap();
        wal.save(&HardState { term: 1, vote: 0, commit: 6 }, &[]).unwrap();
        wal.save_snapshot(&WalSnapshot::new(9, 1)).unwrap();
        wal.close().unwrap();

        let snaps = valid_snapshot_entries(&dir).unwrap();
        assert_eq!(
            snaps.iter().map(|s| s.index).collect::<Vec<_>>(),
            vec![0, 5],
            "snapshot at 9 is beyond commit 6"
        );
    }

    #[test]
    fn test_torn_tail_needs_repair() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("wal");

        let mut wal = Wal::create(&dir, b"m").unwrap();
        wal.save(&HardState { term: 1, vote: 0, commit: 2 }, &ents(1, 1..=2)).unwrap();
        wal.close().unwrap();

        let torn = encode_frame(&WalRecord::Entry(LogEntry::new(1, 3, vec![3; 100]))).unwrap();
        let mut file = OpenOptions::new().append(true).open(segment_path(&dir)).unwrap();
        file.write_all(&torn[..torn.len() - 10]).unwrap();
        drop(file);

        let mut wal = Wal::open(&dir, WalSnapshot::default()).unwrap();
        assert!(wal.read_all().unwrap_err().is_unexpected_eof());

        assert!(repair(&dir));
        assert!(dir.join(format!("{}.broken", segment_name(0, 0))).exists());

        let mut wal = Wal::open(&dir, WalSnapshot::default()).unwrap();
        let (_, state, entries) = wal.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(state.commit, 2);
    }

    #[test]
    fn test_repair_refuses_checksum_damage() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("wal");

        let mut wal = Wal::create(&dir, b"m").unwrap();
        wal.save(&HardState::default(), &ents(1, 1..=2)).unwrap();
        wal.close().unwrap();

        let path = segment_path(&dir);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert!(!repair(&dir));
    }

    #[test]
    fn test_segment_names() {
        assert_eq!(segment_name(1, 0x10), "0000000000000001-0000000000000010.wal");
        assert_eq!(parse_segment_name("0000000000000001-0000000000000010.wal"), Some((1, 16)));
        assert!(parse_segment_name("0000000000000001-0000000000000010.wal.broken").is_none());

        let names = vec![segment_name(0, 0), segment_name(1, 50), segment_name(2, 120)];
        assert_eq!(search_index(&names, 0), Some(0));
        assert_eq!(search_index(&names, 60), Some(1));
        assert_eq!(search_index(&names, 500), Some(2));
        assert!(check_sequence(&names).is_ok());
        assert!(check_sequence(&[segment_name(0, 0), segment_name(2, 9)]).is_err());
    }
}
