//! WAL record types and their on-disk framing.
//!
//! Every record is written as `[u32 len BE][u32 crc32 BE][bincode payload]`.

use crate::error::{Result, TesseraError};
use crate::raft::{ConfState, HardState, LogEntry};
use crate::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};
use std::io::{self, Read};

/// Size of the frame header.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Frames larger than this are treated as corruption rather than allocated.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Position of a snapshot as recorded in the log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalSnapshot {
    pub index: LogIndex,
    pub term: Term,
    pub conf_state: Option<ConfState>,
}

impl WalSnapshot {
    pub fn new(index: LogIndex, term: Term) -> Self {
        Self {
            index,
            term,
            conf_state: None,
        }
    }
}

/// A single WAL record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecord {
    /// Opaque metadata written once when the log is created.
    Metadata(#[serde(with = "serde_bytes")] Vec<u8>),
    /// A Raft log entry.
    Entry(LogEntry),
    /// A hard state update.
    State(HardState),
    /// A snapshot was taken at this position.
    Snapshot(WalSnapshot),
}

/// Serialize a record into its frame.
pub fn encode_frame(record: &WalRecord) -> Result<Vec<u8>> {
    let bytes = bincode::serialize(record)?;
    let len = bytes.len() as u32;
    let crc = crc32fast::hash(&bytes);

    let mut framed = Vec::with_capacity(FRAME_HEADER_SIZE + bytes.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&crc.to_be_bytes());
    framed.extend_from_slice(&bytes);
    Ok(framed)
}

/// Sequential frame decoder.
///
/// A frame cut short, or a zero-filled header left by a torn write, yields an
/// `UnexpectedEof` I/O error. A complete frame with a bad checksum yields
/// [`TesseraError::ChecksumMismatch`].
pub struct FrameReader<R> {
    reader: R,
    /// End of the last complete frame.
    offset: u64,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, offset: 0 }
    }

    /// Byte offset just past the last frame decoded successfully.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next record, or `None` at a clean end of input.
    pub fn next_record(&mut self) -> Result<Option<WalRecord>> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let got = read_full(&mut self.reader, &mut header)?;
        if got == 0 {
            return Ok(None);
        }
        if got < FRAME_HEADER_SIZE || header == [0u8; FRAME_HEADER_SIZE] {
            return Err(torn(self.offset));
        }

        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let stored_crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if len > MAX_FRAME_SIZE {
            return Err(TesseraError::DataCorruption(format!(
                "frame at offset {} claims {} bytes",
                self.offset, len
            )));
        }

        let mut data = vec![0u8; len];
        if read_full(&mut self.reader, &mut data)? < len {
            return Err(torn(self.offset));
        }

        let computed_crc = crc32fast::hash(&data);
        if computed_crc != stored_crc {
            return Err(TesseraError::ChecksumMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let record = bincode::deserialize(&data).map_err(|e| {
            TesseraError::DataCorruption(format!(
                "undecodable record at offset {}: {}",
                self.offset, e
            ))
        })?;
        self.offset += (FRAME_HEADER_SIZE + len) as u64;
        Ok(Some(record))
    }
}

fn torn(offset: u64) -> TesseraError {
    TesseraError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("truncated frame at offset {}", offset),
    ))
}

/// Fill `buf` as far as the input allows. Returns the bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
