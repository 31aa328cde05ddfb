//! Cluster membership.

use super::member::{compute_cluster_id, Member};
use super::store;
use super::urls::{urls_equal, UrlsMap};
use crate::backend::{Backend, Bucket};
use crate::error::{Result, TesseraError};
use crate::types::Id;
use crate::v2store::Store;
use crate::version::Version;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

/// The members of one cluster, as seen by the local member.
#[derive(Debug, Default)]
pub struct RaftCluster {
    local_id: Id,
    cid: Id,
    members: BTreeMap<Id, Member>,
    removed: BTreeSet<Id>,
    version: Option<Version>,
    store: Option<Arc<RwLock<Store>>>,
}

impl RaftCluster {
    /// An empty membership, to be filled by [`RaftCluster::recover`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the membership described by a static URL map.
    pub fn from_urls_map(token: &str, urls: &UrlsMap) -> Result<Self> {
        let mut cluster = Self::new();
        for (name, peer_urls) in urls.iter() {
            let m = Member::new(name, peer_urls, token);
            if cluster.members.contains_key(&m.id) {
                return Err(TesseraError::Config(format!(
                    "member {} ({}) has the same id as another member",
                    name, m.id
                )));
            }
            cluster.members.insert(m.id, m);
        }
        cluster.gen_id();
        Ok(cluster)
    }

    /// Build a membership from members reported by a peer.
    pub fn from_members(cid: Id, members: Vec<Member>) -> Self {
        let mut cluster = Self::new();
        cluster.cid = cid;
        cluster.members = members.into_iter().map(|m| (m.id, m)).collect();
        cluster
    }

    fn gen_id(&mut self) {
        let ids: Vec<Id> = self.members.keys().copied().collect();
        self.cid = compute_cluster_id(&ids);
    }

    pub fn id(&self) -> Id {
        self.cid
    }

    pub fn local_id(&self) -> Id {
        self.local_id
    }

    pub fn set_id(&mut self, local_id: Id, cid: Id) {
        self.local_id = local_id;
        self.cid = cid;
    }

    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub fn member(&self, id: Id) -> Option<&Member> {
        self.members.get(&id)
    }

    /// Members sorted by id.
    pub fn members(&self) -> Vec<&Member> {
        self.members.values().collect()
    }

    pub fn member_ids(&self) -> Vec<Id> {
        self.members.keys().copied().collect()
    }

    pub fn member_by_name(&self, name: &str) -> Option<&Member> {
        let mut found = self.members.values().filter(|m| m.name() == name);
        let first = found.next();
        if first.is_some() && found.next().is_some() {
            warn!(name, "Found multiple members with the same name");
        }
        first
    }

    pub fn is_id_removed(&self, id: Id) -> bool {
        self.removed.contains(&id)
    }

    /// Peer URLs of every member except `local_name`, sorted.
    pub fn remote_peer_urls(&self, local_name: &str) -> Vec<String> {
        let mut urls: Vec<String> = self
            .members
            .values()
            .filter(|m| m.name() != local_name)
            .flat_map(|m| m.peer_urls().iter().cloned())
            .collect();
        urls.sort();
        urls
    }

    /// The URL map string of this membership.
    pub fn urls_map(&self) -> Result<UrlsMap> {
        let mut map = UrlsMap::new();
        for m in self.members.values() {
            for url in m.peer_urls() {
                map.insert(m.name(), url)?;
            }
        }
        Ok(map)
    }

    /// Give each local member the id of the existing member with the same
    /// peer URLs.
    pub fn validate_and_assign_ids(&mut self, existing: &RaftCluster) -> Result<()> {
        if existing.members.len() != self.members.len() {
            return Err(TesseraError::Config(format!(
                "member count is unequal: {} configured, {} in the existing cluster",
                self.members.len(),
                existing.members.len()
            )));
        }

        let mut local: Vec<Member> = self.members.values().cloned().collect();
        for em in existing.members.values() {
            let matched = local
                .iter_mut()
                .find(|lm| urls_equal(lm.peer_urls(), em.peer_urls()))
                .ok_or_else(|| {
                    TesseraError::Config(format!(
                        "peer URLs: no match found for existing member ({}, {:?})",
                        em.id,
                        em.peer_urls()
                    ))
                })?;
            matched.id = em.id;
        }

        self.members = local.into_iter().map(|m| (m.id, m)).collect();
        Ok(())
    }

    /// Attach the v2 store membership is mirrored to.
    pub fn set_store(&mut self, store: Arc<RwLock<Store>>) {
        self.store = Some(store);
    }

    /// Create the buckets membership is persisted to.
    pub fn bind_backend(&self, be: &mut Backend) -> Result<()> {
        for bucket in Bucket::ALL {
            be.ensure_bucket(bucket)?;
        }
        Ok(())
    }

    /// Load members and cluster version, preferring the backend over the v2 store.
    pub fn recover(&mut self, be: &Backend) -> Result<()> {
        let (mut members, mut removed, mut version) = store::load_from_backend(be)?;
        if members.is_empty() {
            if let Some(st) = &self.store {
                (members, removed, version) = store::load_from_store(&st.read())?;
            }
        }

        self.members = members;
        self.removed = removed;
        self.version = version;

        for m in self.members.values() {
            info!(
                cluster_id = %self.cid,
                local_member_id = %self.local_id,
                recovered_remote_peer_id = %m.id,
                recovered_remote_peer_urls = ?m.peer_urls(),
                "Recovered member"
            );
        }
        if let Some(v) = self.version {
            info!(cluster_id = %self.cid, cluster_version = %v, "Set cluster version from store");
        }
        Ok(())
    }

    /// Add a member, persisting it to the store and, when given, the backend.
    pub fn add_member(&mut self, m: Member, be: Option<&Backend>) -> Result<()> {
        if self.members.contains_key(&m.id) || self.is_id_removed(m.id) {
            return Err(TesseraError::AlreadyExists(format!("member {}", m.id)));
        }
        if let Some(st) = &self.store {
            store::save_member_to_store(&mut st.write(), &m)?;
        }
        if let Some(be) = be {
            store::save_member_to_backend(be, &m)?;
        }
        info!(cluster_id = %self.cid, added_peer_id = %m.id, added_peer_urls = ?m.peer_urls(), "Added member");
        self.members.insert(m.id, m);
        Ok(())
    }

    pub fn set_version(&mut self, v: Version, be: Option<&Backend>) -> Result<()> {
        if let Some(st) = &self.store {
            store::save_version_to_store(&mut st.write(), &v)?;
        }
        if let Some(be) = be {
            store::save_version_to_backend(be, &v)?;
        }
        self.version = Some(v);
        Ok(())
    }
}
