//! Cluster membership: members, their identifiers and where they are persisted.

mod cluster;
mod member;
mod store;
mod urls;

pub use cluster::RaftCluster;
pub use member::{compute_cluster_id, compute_member_id, Attributes, Member, RaftAttributes};
pub use urls::{normalize_url, urls_equal, UrlsMap};
