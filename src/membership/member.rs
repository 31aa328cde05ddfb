//! Cluster members.

use crate::error::Result;
use crate::types::Id;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Attributes that go through consensus when changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaftAttributes {
    #[serde(rename = "peerURLs")]
    pub peer_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_learner: bool,
}

/// Attributes a member publishes about itself once it is serving.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "clientURLs", default, skip_serializing_if = "Vec::is_empty")]
    pub client_urls: Vec<String>,
}

/// A cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: Id,
    #[serde(flatten)]
    pub raft_attributes: RaftAttributes,
    #[serde(flatten)]
    pub attributes: Attributes,
}

impl Member {
    /// A voting member whose id derives from its peer URLs and the cluster token.
    pub fn new(name: &str, peer_urls: &[String], token: &str) -> Self {
        let mut urls = peer_urls.to_vec();
        urls.sort();
        Self {
            id: compute_member_id(&urls, token),
            raft_attributes: RaftAttributes {
                peer_urls: urls,
                is_learner: false,
            },
            attributes: Attributes {
                name: name.to_string(),
                client_urls: Vec::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.attributes.name
    }

    pub fn peer_urls(&self) -> &[String] {
        &self.raft_attributes.peer_urls
    }

    pub fn client_urls(&self) -> &[String] {
        &self.attributes.client_urls
    }

    /// A member has started once it published client URLs.
    pub fn is_started(&self) -> bool {
        !self.attributes.client_urls.is_empty()
    }

    /// JSON form, used as the context of membership change entries.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// First eight bytes of SHA-256 over the sorted URLs followed by the token.
pub fn compute_member_id(sorted_urls: &[String], token: &str) -> Id {
    let mut hasher = Sha256::new();
    for url in sorted_urls {
        hasher.update(url.as_bytes());
    }
    hasher.update(token.as_bytes());
    Id(prefix_u64(&hasher.finalize()))
}

/// First eight bytes of SHA-256 over the member ids in ascending order.
pub fn compute_cluster_id(member_ids: &[Id]) -> Id {
    let mut ids = member_ids.to_vec();
    ids.sort();
    let mut hasher = Sha256::new();
    for id in ids {
        hasher.update(id.0.to_be_bytes());
    }
    Id(prefix_u64(&hasher.finalize()))
}

fn prefix_u64(digest: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_member_id_is_stable() {
        let a = Member::new("a", &urls(&["http://10.0.0.1:2380", "http://10.0.0.1:7001"]), "tok");
        let b = Member::new("renamed", &urls(&["http://10.0.0.1:7001", "http://10.0.0.1:2380"]), "tok");
        assert_eq!(a.id, b.id, "name and URL order do not affect the id");

        let c = Member::new("a", &urls(&["http://10.0.0.1:2380", "http://10.0.0.1:7001"]), "other");
        assert_ne!(a.id, c.id);
        assert!(!a.id.is_none());
    }

    #[test]
    fn test_cluster_id_ignores_order() {
        let ids = vec![Id(3), Id(1), Id(2)];
        assert_eq!(compute_cluster_id(&ids), compute_cluster_id(&[Id(1), Id(2), Id(3)]));
        assert_ne!(compute_cluster_id(&ids), compute_cluster_id(&[Id(1), Id(2)]));
    }

    #[test]
    fn test_json_shape() {
        let mut m = Member::new("infra1", &urls(&["http://127.0.0.1:2380"]), "tok");
        m.id = Id(0x1234);
        let json: serde_json::Value = serde_json::from_slice(&m.to_json().unwrap()).unwrap();
        assert_eq!(json["id"], "1234");
        assert_eq!(json["name"], "infra1");
        assert_eq!(json["peerURLs"][0], "http://127.0.0.1:2380");
        assert!(json.get("isLearner").is_none());
        assert!(json.get("clientURLs").is_none());

        m.attributes.client_urls = urls(&["http://127.0.0.1:2379"]);
        let back: Member = serde_json::from_slice(&m.to_json().unwrap()).unwrap();
        assert_eq!(back, m);
        assert!(back.is_started());
    }
}
