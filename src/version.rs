//! Server and cluster versions, and the capabilities each cluster version enables.

use crate::error::{Result, TesseraError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Version of this server binary.
pub const SERVER_VERSION: Version = Version::new(3, 6, 0);

/// Oldest cluster version a new member may join.
pub const MIN_CLUSTER_VERSION: Version = Version::new(3, 0, 0);

/// First release whose data lives in the backend rather than the v2 store.
pub const V3_0: Version = Version::new(3, 0, 0);

/// A `major.minor.patch` version. Pre-release and build suffixes are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }

    /// The `major.minor.0` release line this version belongs to.
    pub fn release_line(&self) -> Version {
        Version::new(self.major, self.minor, 0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        let core = s
            .trim()
            .trim_start_matches('v')
            .split(['-', '+'])
            .next()
            .unwrap_or_default();

        let mut parts = core.split('.');
        let mut next = |what: &str| -> Result<u64> {
            match parts.next() {
                Some(p) => p.parse::<u64>().map_err(|_| {
                    TesseraError::Deserialization(format!("invalid {} in version {:?}", what, s))
                }),
                None if what == "major" => Err(TesseraError::Deserialization(format!(
                    "empty version {:?}",
                    s
                ))),
                None => Ok(0),
            }
        };

        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;
        Ok(Version::new(major, minor, patch))
    }
}

impl Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Versions reported by a peer's `/version` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Server binary version.
    pub server: String,
    /// Cluster version, as agreed by the members.
    pub cluster: String,
}

/// Features gated on the cluster version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Authentication and role based access.
    Auth,
    /// Backend-native request API.
    V3Rpc,
    /// Non-voting learner members.
    Learner,
    /// Storage version tracked inside the backend.
    StorageVersion,
}

/// Capabilities enabled for the cluster version currently in force.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    enabled: BTreeSet<Capability>,
}

impl Capabilities {
    /// Capabilities a cluster running `version` supports.
    pub fn for_version(version: &Version) -> Self {
        let line = version.release_line();
        let mut enabled = BTreeSet::new();
        if line >= Version::new(3, 0, 0) {
            enabled.insert(Capability::Auth);
            enabled.insert(Capability::V3Rpc);
        }
        if line >= Version::new(3, 4, 0) {
            enabled.insert(Capability::Learner);
        }
        if line >= Version::new(3, 6, 0) {
            enabled.insert(Capability::StorageVersion);
        }
        Self { enabled }
    }

    /// Replace the enabled set with the one for `version`.
    pub fn update(&mut self, version: &Version) {
        *self = Self::for_version(version);
        tracing::info!(
            cluster_version = %version.release_line(),
            capabilities = ?self.enabled,
            "Enabled capabilities for version"
        );
    }

    pub fn is_enabled(&self, cap: Capability) -> bool {
        self.enabled.contains(&cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!("3.6.0".parse::<Version>().unwrap(), Version::new(3, 6, 0));
        assert_eq!("3.5".parse::<Version>().unwrap(), Version::new(3, 5, 0));
        assert_eq!("v3.4.1-rc.0".parse::<Version>().unwrap(), Version::new(3, 4, 1));
        assert!("".parse::<Version>().is_err());
        assert!("three".parse::<Version>().is_err());
    }

    #[test]
    fn test_ordering() {
        assert!(Version::new(3, 0, 0) < Version::new(3, 6, 0));
        assert!(Version::new(2, 3, 9) < V3_0);
        assert_eq!(Version::new(3, 6, 2).release_line(), Version::new(3, 6, 0));
    }

    #[test]
    fn test_capabilities_follow_version() {
        let caps = Capabilities::for_version(&Version::new(2, 3, 0));
        assert!(!caps.is_enabled(Capability::Auth));

        let mut caps = Capabilities::for_version(&Version::new(3, 0, 0));
        assert!(caps.is_enabled(Capability::V3Rpc));
        assert!(!caps.is_enabled(Capability::Learner));

        caps.update(&Version::new(3, 6, 0));
        assert!(caps.is_enabled(Capability::Learner));
        assert!(caps.is_enabled(Capability::StorageVersion));
    }
}
