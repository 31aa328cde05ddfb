//! Queries against remote peers.

use super::CLUSTER_ID_HEADER;
use crate::error::{Result, TesseraError};
use crate::membership::{Member, RaftCluster};
use crate::types::Id;
use crate::version::{Version, VersionInfo, SERVER_VERSION};
use reqwest::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Connection timeout for peer requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Reported for the local member while its cluster version is unknown.
const VERSION_NOT_DECIDED: &str = "not_decided";

/// HTTP client for the peer API.
#[derive(Debug, Clone)]
pub struct PeerClient {
    client: Client,
}

impl PeerClient {
    /// Create a client whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .build()
            .map_err(|e| TesseraError::Network(format!("failed to build peer client: {}", e)))?;
        Ok(Self { client })
    }

    /// Fetch the membership known to the peer at `url`.
    pub async fn fetch_members(&self, url: &str) -> Result<RaftCluster> {
        let response = self
            .client
            .get(format!("{}/members", url.trim_end_matches('/')))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TesseraError::Network(format!(
                "{} answered /members with {}",
                url,
                response.status()
            )));
        }

        let cid: Id = response
            .headers()
            .get(CLUSTER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                TesseraError::Network(format!("{} sent no valid {} header", url, CLUSTER_ID_HEADER))
            })?;

        let members: Vec<Member> = response
            .json()
            .await
            .map_err(|e| TesseraError::Deserialization(e.to_string()))?;
        if members.is_empty() {
            return Err(TesseraError::Network(format!("{} reported no members", url)));
        }

        Ok(RaftCluster::from_members(cid, members))
    }

    /// Fetch the server and cluster versions of the peer at `url`.
    pub async fn fetch_version(&self, url: &str) -> Result<VersionInfo> {
        let response = self
            .client
            .get(format!("{}/version", url.trim_end_matches('/')))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TesseraError::Network(format!(
                "{} answered /version with {}",
                url,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| TesseraError::Deserialization(e.to_string()))
    }
}

/// Ask each URL in turn for the cluster membership. The first answer wins.
pub async fn get_cluster_from_remote_peers(
    urls: &[String],
    timeout: Duration,
) -> Result<RaftCluster> {
    let client = PeerClient::new(timeout)?;
    for url in urls {
        match client.fetch_members(url).await {
            Ok(cluster) => {
                debug!(url = %url, cluster_id = %cluster.id(), "Fetched cluster from peer");
                return Ok(cluster);
            }
            Err(e) => {
                warn!(remote_peer_url = %url, error = %e, "Failed to get cluster response");
            }
        }
    }
    Err(TesseraError::Network(
        "could not retrieve cluster information from the given URLs".to_string(),
    ))
}

/// Versions of every member, keyed by id. Unreachable members map to `None`.
pub async fn get_versions(
    cluster: &RaftCluster,
    local_id: Id,
    timeout: Duration,
) -> Result<BTreeMap<Id, Option<VersionInfo>>> {
    let client = PeerClient::new(timeout)?;
    let mut versions = BTreeMap::new();

    for m in cluster.members() {
        if m.id == local_id {
            let cluster_version = cluster
                .version()
                .map(|v| v.to_string())
                .unwrap_or_else(|| VERSION_NOT_DECIDED.to_string());
            versions.insert(
                m.id,
                Some(VersionInfo {
                    server: SERVER_VERSION.to_string(),
                    cluster: cluster_version,
                }),
            );
            continue;
        }

        let mut reported = None;
        for url in m.peer_urls() {
            match client.fetch_version(url).await {
                Ok(v) => {
                    reported = Some(v);
                    break;
                }
                Err(e) => {
                    warn!(remote_member_id = %m.id, remote_peer_url = %url, error = %e, "Failed to get version");
                }
            }
        }
        versions.insert(m.id, reported);
    }
    Ok(versions)
}

/// Whether the remote members run a cluster version in `[min, max]`.
///
/// The local member and unreachable members are ignored. At least one remote
/// member must report a usable version.
pub fn is_compatible_with_versions(
    versions: &BTreeMap<Id, Option<VersionInfo>>,
    local_id: Id,
    min: Version,
    max: Version,
) -> bool {
    let mut ok = false;
    for (id, info) in versions {
        if *id == local_id {
            continue;
        }
        let Some(info) = info else {
            continue;
        };
        let cluster_version: Version = match info.cluster.parse() {
            Ok(v) => v,
            Err(e) => {
                warn!(remote_member_id = %id, cluster_version = %info.cluster, error = %e, "Failed to parse cluster version of remote member");
                continue;
            }
        };
        if cluster_version < min {
            warn!(
                remote_member_id = %id,
                remote_cluster_version = %cluster_version,
                minimum_cluster_version = %min,
                "Cluster version of remote member is not compatible; too low"
            );
            return false;
        }
        if cluster_version > max {
            warn!(
                remote_member_id = %id,
                remote_cluster_version = %cluster_version,
                maximum_cluster_version = %max,
                "Cluster version of remote member is not compatible; too high"
            );
            return false;
        }
        ok = true;
    }
    ok
}

/// Whether this server can join `cluster`.
pub async fn is_compatible_with_cluster(
    cluster: &RaftCluster,
    local_id: Id,
    timeout: Duration,
) -> Result<bool> {
    let versions = get_versions(cluster, local_id, timeout).await?;
    Ok(is_compatible_with_versions(
        &versions,
        local_id,
        crate::version::MIN_CLUSTER_VERSION,
        SERVER_VERSION,
    ))
}
