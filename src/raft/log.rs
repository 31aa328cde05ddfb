//! Raft log entries and membership configuration changes.

use crate::error::{Result, TesseraError};
use crate::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Kind of payload carried by a [`LogEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    /// Application command.
    Normal,
    /// Serialized [`ConfChange`].
    ConfChange,
}

/// A single entry in the Raft log.
///
/// Uses Arc<Vec<u8>> for the data field so entries can be cloned between the
/// durable log and in-memory storage without copying payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when the entry was received.
    pub term: Term,
    /// The index of this entry in the log.
    pub index: LogIndex,
    /// What `data` holds.
    pub entry_type: EntryType,
    /// The command data (Arc-wrapped for cheap cloning).
    #[serde(with = "arc_bytes")]
    pub data: Arc<Vec<u8>>,
}

impl LogEntry {
    /// Create a new normal entry.
    pub fn new(term: Term, index: LogIndex, data: Vec<u8>) -> Self {
        Self {
            term,
            index,
            entry_type: EntryType::Normal,
            data: Arc::new(data),
        }
    }

    /// Create an entry carrying a membership change.
    pub fn conf_change(term: Term, index: LogIndex, cc: &ConfChange) -> Result<Self> {
        Ok(Self {
            term,
            index,
            entry_type: EntryType::ConfChange,
            data: Arc::new(cc.encode()?),
        })
    }

    /// Get a reference to the data bytes.
    #[inline]
    pub fn data_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Decode the membership change, if this entry is one.
    pub fn as_conf_change(&self) -> Result<Option<ConfChange>> {
        match self.entry_type {
            EntryType::ConfChange => ConfChange::decode(&self.data).map(Some),
            EntryType::Normal => Ok(None),
        }
    }
}

/// Serde helper module for Arc<Vec<u8>> serialization.
/// Serializes as raw bytes, deserializes into Arc-wrapped Vec.
mod arc_bytes {
    use serde::{Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(data: &Arc<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::serialize(data.as_slice(), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        Ok(Arc::new(bytes))
    }
}

/// Membership change operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfChangeType {
    AddNode,
    RemoveNode,
    UpdateNode,
    AddLearnerNode,
}

/// A membership change proposal. `context` is opaque to the engine; the
/// server stores the JSON member descriptor there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfChange {
    pub change_type: ConfChangeType,
    pub node_id: NodeId,
    #[serde(with = "serde_bytes")]
    pub context: Vec<u8>,
}

impl ConfChange {
    pub fn new(change_type: ConfChangeType, node_id: NodeId, context: Vec<u8>) -> Self {
        Self {
            change_type,
            node_id,
            context,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data)
            .map_err(|e| TesseraError::RaftLog(format!("Invalid conf change: {}", e)))
    }
}
