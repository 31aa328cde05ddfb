//! Resolving cluster membership along one of the three bootstrap paths.

use super::backend::BootstrappedBackend;
use super::raft::BootstrappedRaft;
use super::wal::{bootstrap_new_wal, bootstrap_wal_from_snapshot, BootstrappedWal};
use super::{check_dir_writeable, BootstrapPath, SnapshotMetadata};
use crate::config::ServerConfig;
use crate::error::{Result, TesseraError};
use crate::membership::{Member, RaftCluster, UrlsMap};
use crate::peer::{self, discovery};
use crate::types::Id;
use crate::v2store::Store;
use crate::version::{Capabilities, MIN_CLUSTER_VERSION, V3_0};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

/// Membership, local id and log, ready for the engine builder.
#[derive(Debug)]
pub(super) struct BootstrappedCluster {
    pub cluster: RaftCluster,
    pub node_id: Id,
    pub wal: BootstrappedWal,
    pub raft: BootstrappedRaft,
    pub path: BootstrapPath,
    pub capabilities: Capabilities,
}

/// Pick the path for `{have_wal, cfg.new_cluster}` and resolve membership along it.
pub(super) async fn bootstrap_cluster(
    cfg: &ServerConfig,
    have_wal: bool,
    st: &Arc<RwLock<Store>>,
    be: &mut BootstrappedBackend,
) -> Result<BootstrappedCluster> {
    let mut opened = None;
    if have_wal {
        check_dir_writeable(&cfg.wal_dir())
            .map_err(|e| TesseraError::Storage(format!("cannot write to WAL directory: {}", e)))?;
        opened = Some(bootstrap_wal_from_snapshot(cfg, be.snapshot.clone())?);
    }

    let mut capabilities = Capabilities::for_version(&MIN_CLUSTER_VERSION);

    let (cluster, node_id, wal, raft, path) = match (opened, cfg.new_cluster) {
        (None, false) => {
            let (mut cl, node_id, remotes) = bootstrap_existing_cluster_no_wal(cfg, st, be).await?;
            let bwal = bootstrap_new_wal(cfg, node_id, cl.id())?;
            let raft = BootstrappedRaft::from_cluster(cfg, &cl, node_id, &[], &bwal)?;
            cl.set_id(node_id, cl.id());
            (cl, node_id, bwal, raft, BootstrapPath::JoinExisting { remotes })
        }
        (None, true) => {
            let (mut cl, node_id) = bootstrap_new_cluster_no_wal(cfg, st, be).await?;
            let bwal = bootstrap_new_wal(cfg, node_id, cl.id())?;
            let ids = cl.member_ids();
            let raft = BootstrappedRaft::from_cluster(cfg, &cl, node_id, &ids, &bwal)?;
            cl.set_id(node_id, cl.id());
            (cl, node_id, bwal, raft, BootstrapPath::NewCluster)
        }
        (Some((bwal, meta)), _) => {
            let cl = bootstrap_cluster_with_wal(cfg, st, be, &meta, &mut capabilities)?;
            let raft = BootstrappedRaft::from_snapshot(cfg, &bwal, &meta)?;
            (cl, meta.node_id, bwal, raft, BootstrapPath::RestartFromLog { meta })
        }
    };

    Ok(BootstrappedCluster {
        cluster,
        node_id,
        wal,
        raft,
        path,
        capabilities,
    })
}

async fn bootstrap_existing_cluster_no_wal(
    cfg: &ServerConfig,
    st: &Arc<RwLock<Store>>,
    be: &mut BootstrappedBackend,
) -> Result<(RaftCluster, Id, Vec<Member>)> {
    cfg.verify_join_existing()?;
    let mut cl = RaftCluster::from_urls_map(&cfg.initial_cluster_token, &cfg.initial_cluster)?;

    let existing =
        peer::get_cluster_from_remote_peers(&cl.remote_peer_urls(&cfg.name), cfg.peer_timeout)
            .await
            .map_err(|e| {
                TesseraError::Network(format!("cannot fetch cluster info from peer urls: {}", e))
            })?;

    cl.validate_and_assign_ids(&existing).map_err(|e| {
        TesseraError::Config(format!("error validating peerURLs {}: {}", existing.id(), e))
    })?;

    let local_id = local_member_id(&cl, &cfg.name)?;
    if !peer::is_compatible_with_cluster(&cl, local_id, cfg.peer_timeout).await? {
        return Err(TesseraError::Incompatible(
            "incompatible with current running cluster".to_string(),
        ));
    }

    let remotes = existing.members().into_iter().cloned().collect();
    cl.set_id(Id::NONE, existing.id());
    cl.set_store(Arc::clone(st));
    cl.bind_backend(&mut be.backend)?;
    Ok((cl, local_id, remotes))
}

async fn bootstrap_new_cluster_no_wal(
    cfg: &ServerConfig,
    st: &Arc<RwLock<Store>>,
    be: &mut BootstrappedBackend,
) -> Result<(RaftCluster, Id)> {
    cfg.verify_bootstrap()?;
    let mut cl = RaftCluster::from_urls_map(&cfg.initial_cluster_token, &cfg.initial_cluster)?;

    let m_id = local_member_id(&cl, &cfg.name)?;
    if is_member_bootstrapped(&cl, &cfg.name, cfg).await {
        return Err(TesseraError::AlreadyBootstrapped(m_id.to_string()));
    }

    if let Some(url) = cfg.discovery_url.as_deref() {
        let returned = discovery::join_cluster(
            url,
            cfg.discovery_proxy.as_deref(),
            m_id,
            &cfg.initial_cluster.to_string(),
            cfg.peer_timeout,
        )
        .await?;

        let urls: UrlsMap = returned.parse()?;
        if let Some(dup) = urls.duplicate_url() {
            return Err(TesseraError::InvalidConfig {
                field: "discovery".to_string(),
                reason: format!("discovery cluster {} has duplicate url {}", urls, dup),
            });
        }
        cl = RaftCluster::from_urls_map(&cfg.initial_cluster_token, &urls)?;
    }

    cl.set_store(Arc::clone(st));
    cl.bind_backend(&mut be.backend)?;
    let node_id = local_member_id(&cl, &cfg.name)?;
    Ok((cl, node_id))
}

fn bootstrap_cluster_with_wal(
    cfg: &ServerConfig,
    st: &Arc<RwLock<Store>>,
    be: &mut BootstrappedBackend,
    meta: &SnapshotMetadata,
    capabilities: &mut Capabilities,
) -> Result<RaftCluster> {
    check_dir_writeable(&cfg.member_dir())
        .map_err(|e| TesseraError::Storage(format!("cannot write to member directory: {}", e)))?;

    if cfg.discovery_url.is_some() {
        warn!(
            wal_dir = %cfg.wal_dir().display(),
            "Discovery token is ignored since cluster already initialized; valid logs are found"
        );
    }

    let mut cl = RaftCluster::new();
    cl.set_id(meta.node_id, meta.cluster_id);
    cl.set_store(Arc::clone(st));
    cl.bind_backend(&mut be.backend)?;
    cl.recover(&be.backend)?;
    if let Some(v) = cl.version() {
        capabilities.update(&v);
    }

    if cl.version().is_some_and(|v| v >= V3_0) && !be.be_exist {
        be.remove_on_failure = true;
        return Err(TesseraError::DataCorruption(format!(
            "database file ({}) of the backend is missing",
            cfg.backend_path().display()
        )));
    }
    Ok(cl)
}

/// Whether a remote member already lists us as a started member.
async fn is_member_bootstrapped(cl: &RaftCluster, name: &str, cfg: &ServerConfig) -> bool {
    let remote = match peer::get_cluster_from_remote_peers(&cl.remote_peer_urls(name), cfg.peer_timeout).await {
        Ok(remote) => remote,
        Err(_) => return false,
    };
    let Some(local) = cl.member_by_name(name) else {
        return false;
    };
    match remote.member(local.id) {
        Some(m) if m.is_started() => {
            info!(member_id = %m.id, client_urls = ?m.client_urls(), "Member already published to the cluster");
            true
        }
        _ => false,
    }
}

fn local_member_id(cl: &RaftCluster, name: &str) -> Result<Id> {
    cl.member_by_name(name).map(|m| m.id).ok_or_else(|| TesseraError::InvalidConfig {
        field: "name".to_string(),
        reason: format!("member {:?} is not in the cluster", name),
    })
}
