//! Peer HTTP API: membership and version queries, and discovery.

mod client;
pub mod discovery;
mod handler;

pub use client::{
    get_cluster_from_remote_peers, get_versions, is_compatible_with_cluster,
    is_compatible_with_versions, PeerClient,
};
pub use discovery::join_cluster;
pub use handler::{router, serve, PeerState};

/// Response header carrying the cluster id on `/members`.
pub const CLUSTER_ID_HEADER: &str = "x-tessera-cluster-id";
