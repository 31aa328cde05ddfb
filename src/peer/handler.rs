//! Peer API endpoints answering membership and version queries.

use super::CLUSTER_ID_HEADER;
use crate::error::Result;
use crate::membership::{Member, RaftCluster};
use crate::types::Id;
use crate::version::VersionInfo;
use axum::{
    extract::State,
    http::{HeaderName, HeaderValue},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// What a member tells its peers about the cluster.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub cluster_id: Id,
    pub members: Vec<Member>,
    pub versions: VersionInfo,
}

impl PeerState {
    pub fn from_cluster(cluster: &RaftCluster, versions: VersionInfo) -> Self {
        Self {
            cluster_id: cluster.id(),
            members: cluster.members().into_iter().cloned().collect(),
            versions,
        }
    }
}

/// Build the peer router.
pub fn router(state: PeerState) -> Router {
    Router::new()
        .route("/members", get(handle_members))
        .route("/version", get(handle_version))
        .with_state(Arc::new(state))
}

/// Serve the peer router on `listener` until the task is dropped.
pub async fn serve(listener: TcpListener, state: PeerState) -> Result<()> {
    info!(addr = ?listener.local_addr().ok(), "Serving peer API");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn handle_members(State(state): State<Arc<PeerState>>) -> impl IntoResponse {
    let header = HeaderValue::from_str(&state.cluster_id.to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("0"));
    (
        [(HeaderName::from_static(CLUSTER_ID_HEADER), header)],
        Json(state.members.clone()),
    )
}

async fn handle_version(State(state): State<Arc<PeerState>>) -> Json<VersionInfo> {
    Json(state.versions.clone())
}
