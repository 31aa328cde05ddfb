//! Core type definitions shared across the bootstrap.
//!
//! # Type Aliases
//!
//! - [`NodeId`] = `u64`: consensus node identifier
//! - [`Term`] = `u64`: Raft term number
//! - [`LogIndex`] = `u64`: Raft log position
//!
//! # Identifiers
//!
//! Member and cluster identifiers are 64-bit values derived from hashes. They are
//! always shown and exchanged as lowercase hex, so [`Id`] wraps the raw value and
//! serializes as a hex string.
//!
//! ```rust
//! use tessera::types::Id;
//!
//! let id: Id = "8e9e05c52164694d".parse().unwrap();
//! assert_eq!(id.to_string(), "8e9e05c52164694d");
//! assert_eq!(u64::from(id), 0x8e9e05c52164694d);
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a consensus node.
pub type NodeId = u64;

/// Raft term number.
pub type Term = u64;

/// Position in the Raft log.
pub type LogIndex = u64;

/// Member or cluster identifier, rendered as hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Id(pub u64);

impl Id {
    /// The zero id, never a valid member.
    pub const NONE: Id = Id(0);

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for Id {
    fn from(v: u64) -> Self {
        Id(v)
    }
}

impl From<Id> for u64 {
    fn from(id: Id) -> Self {
        id.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl FromStr for Id {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(Id)
    }
}

impl Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
