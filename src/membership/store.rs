//! Persisting membership to the v2 store and the backend.
//!
//! In the v2 store a member lives under `/0/members/{id}` as two JSON values,
//! `raftAttributes` and `attributes`. Removed ids are kept under
//! `/0/removed_members/{id}` and the cluster version at `/0/version`.
//!
//! In the backend a member is one JSON value keyed by its hex id in the
//! `members` bucket, removed ids go to `members_removed`, and the cluster
//! version is `clusterVersion` in the `cluster` bucket.

use super::member::{Attributes, Member, RaftAttributes};
use crate::backend::{Backend, Bucket};
use crate::error::{Result, TesseraError};
use crate::types::Id;
use crate::v2store::Store;
use crate::version::Version;
use std::collections::{BTreeMap, BTreeSet};

const MEMBERS_PREFIX: &str = "/0/members";
const REMOVED_MEMBERS_PREFIX: &str = "/0/removed_members";
const VERSION_KEY: &str = "/0/version";
const RAFT_ATTRIBUTES: &str = "raftAttributes";
const ATTRIBUTES: &str = "attributes";
const CLUSTER_VERSION_KEY: &[u8] = b"clusterVersion";

fn member_dir(id: Id) -> String {
    format!("{}/{}", MEMBERS_PREFIX, id)
}

pub(crate) fn save_member_to_store(store: &mut Store, m: &Member) -> Result<()> {
    let dir = member_dir(m.id);
    store.set(
        &format!("{}/{}", dir, RAFT_ATTRIBUTES),
        serde_json::to_string(&m.raft_attributes)?,
    )?;
    store.set(
        &format!("{}/{}", dir, ATTRIBUTES),
        serde_json::to_string(&m.attributes)?,
    )?;
    Ok(())
}

pub(crate) fn save_version_to_store(store: &mut Store, v: &Version) -> Result<()> {
    store.set(VERSION_KEY, v.to_string())
}

/// Members, removed ids and version held in the v2 store.
pub(crate) fn load_from_store(
    store: &Store,
) -> Result<(BTreeMap<Id, Member>, BTreeSet<Id>, Option<Version>)> {
    let mut members = BTreeMap::new();
    for name in store.list(MEMBERS_PREFIX) {
        let id: Id = name
            .parse()
            .map_err(|_| TesseraError::DataCorruption(format!("v2 store: bad member id {:?}", name)))?;
        let dir = member_dir(id);

        let raft = store
            .get(&format!("{}/{}", dir, RAFT_ATTRIBUTES))
            .ok_or_else(|| {
                TesseraError::DataCorruption(format!("v2 store: member {} has no raft attributes", id))
            })?;
        let raft_attributes: RaftAttributes = serde_json::from_str(raft)?;
        let attributes: Attributes = match store.get(&format!("{}/{}", dir, ATTRIBUTES)) {
            Some(raw) => serde_json::from_str(raw)?,
            None => Attributes::default(),
        };

        members.insert(
            id,
            Member {
                id,
                raft_attributes,
                attributes,
            },
        );
    }

    let removed = store
        .list(REMOVED_MEMBERS_PREFIX)
        .iter()
        .filter_map(|name| name.parse().ok())
        .collect();

    let version = store.get(VERSION_KEY).map(str::parse).transpose()?;
    Ok((members, removed, version))
}

pub(crate) fn save_member_to_backend(be: &Backend, m: &Member) -> Result<()> {
    be.put(
        Bucket::Members,
        m.id.to_string().as_bytes(),
        &serde_json::to_vec(m)?,
    )
}

pub(crate) fn save_version_to_backend(be: &Backend, v: &Version) -> Result<()> {
    be.put(Bucket::Cluster, CLUSTER_VERSION_KEY, v.to_string().as_bytes())
}

/// Members, removed ids and version held in the backend.
pub(crate) fn load_from_backend(
    be: &Backend,
) -> Result<(BTreeMap<Id, Member>, BTreeSet<Id>, Option<Version>)> {
    let mut members = BTreeMap::new();
    for (_, value) in be.scan(Bucket::Members)? {
        let m: Member = serde_json::from_slice(&value)?;
        members.insert(m.id, m);
    }

    let mut removed = BTreeSet::new();
    for (key, _) in be.scan(Bucket::MembersRemoved)? {
        let id = std::str::from_utf8(&key)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TesseraError::DataCorruption("backend: bad removed member id".to_string()))?;
        removed.insert(id);
    }

    let version = match be.get(Bucket::Cluster, CLUSTER_VERSION_KEY)? {
        Some(raw) => Some(
            String::from_utf8_lossy(&raw).parse::<Version>()?,
        ),
        None => None,
    };
    Ok((members, removed, version))
}
