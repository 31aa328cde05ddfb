//! Configuration module for a tessera replica.

use crate::error::{Result, TesseraError};
use crate::membership::{urls_equal, UrlsMap};
use crate::v2store::V2DeprecationLevel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Requests larger than this are allowed but discouraged.
pub const RECOMMENDED_MAX_REQUEST_BYTES: u64 = 10 * 1024 * 1024;

/// Startup parameters for one replica. Read-only once bootstrap begins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Human-readable member name, unique within the cluster.
    pub name: String,
    /// Root data directory.
    pub data_dir: PathBuf,
    /// Dedicated log directory. Defaults to `{data_dir}/member/wal`.
    #[serde(default)]
    pub dedicated_wal_dir: Option<PathBuf>,
    /// Peer URLs this member advertises to the rest of the cluster.
    pub advertise_peer_urls: Vec<String>,
    /// Client URLs this member advertises.
    #[serde(default)]
    pub advertise_client_urls: Vec<String>,
    /// Static initial cluster (`name=url,...`).
    #[serde(default)]
    pub initial_cluster: UrlsMap,
    /// Token mixed into member and cluster IDs.
    pub initial_cluster_token: String,
    /// Form a new cluster rather than join a running one.
    #[serde(default)]
    pub new_cluster: bool,
    /// Discard uncommitted entries and reform a single-member cluster.
    #[serde(default)]
    pub force_new_cluster: bool,
    /// Discovery service URL.
    #[serde(default)]
    pub discovery_url: Option<String>,
    /// Proxy for discovery traffic.
    #[serde(default)]
    pub discovery_proxy: Option<String>,
    /// Duration of one consensus tick.
    #[serde(with = "humantime_serde")]
    pub tick: Duration,
    /// Ticks without a leader before an election.
    pub election_ticks: usize,
    /// Enable pre-vote.
    #[serde(default)]
    pub pre_vote: bool,
    /// Largest client request accepted.
    pub max_request_bytes: u64,
    /// Largest append message sent to a follower.
    pub max_size_per_msg: u64,
    /// Append messages in flight per follower.
    pub max_inflight_msgs: usize,
    /// Defragment at startup when at least this many MB are reclaimable. Zero disables.
    #[serde(default)]
    pub defrag_threshold_mb: u64,
    /// Skip fsync on the log. Unsafe outside tests.
    #[serde(default)]
    pub unsafe_no_fsync: bool,
    /// How strictly legacy v2 store content is rejected.
    #[serde(default)]
    pub v2_deprecation: V2DeprecationLevel,
    /// Per-peer bound for membership, version and discovery requests.
    #[serde(with = "humantime_serde")]
    pub peer_timeout: Duration,
}

impl ServerConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TesseraError::Config(format!("Failed to read config file: {}", e))
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            TesseraError::Config(format!("Failed to parse config: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(TesseraError::InvalidConfig {
                field: "name".to_string(),
                reason: "Member name must be set".to_string(),
            });
        }

        if self.advertise_peer_urls.is_empty() {
            return Err(TesseraError::InvalidConfig {
                field: "advertise_peer_urls".to_string(),
                reason: "At least one peer URL must be advertised".to_string(),
            });
        }

        if self.tick.is_zero() {
            return Err(TesseraError::InvalidConfig {
                field: "tick".to_string(),
                reason: "Tick duration must be non-zero".to_string(),
            });
        }

        if self.election_ticks < 2 {
            return Err(TesseraError::InvalidConfig {
                field: "election_ticks".to_string(),
                reason: "Election must span more than one heartbeat tick".to_string(),
            });
        }

        if self.max_inflight_msgs == 0 {
            return Err(TesseraError::InvalidConfig {
                field: "max_inflight_msgs".to_string(),
                reason: "Must allow at least one message in flight".to_string(),
            });
        }

        if self.peer_timeout.is_zero() {
            return Err(TesseraError::InvalidConfig {
                field: "peer_timeout".to_string(),
                reason: "Peer requests must be bounded by a non-zero timeout".to_string(),
            });
        }

        Ok(())
    }

    /// Defaults for a single-member cluster rooted at `data_dir`.
    pub fn development(name: &str, data_dir: impl Into<PathBuf>) -> Self {
        let peer_url = "http://127.0.0.1:2380".to_string();
        let mut initial_cluster = UrlsMap::new();
        let _ = initial_cluster.insert(name, &peer_url);

        Self {
            name: name.to_string(),
            data_dir: data_dir.into(),
            dedicated_wal_dir: None,
            advertise_peer_urls: vec![peer_url],
            advertise_client_urls: vec!["http://127.0.0.1:2379".to_string()],
            initial_cluster,
            initial_cluster_token: "tessera-cluster".to_string(),
            new_cluster: true,
            force_new_cluster: false,
            discovery_url: None,
            discovery_proxy: None,
            tick: Duration::from_millis(100),
            election_ticks: 10,
            pre_vote: true,
            max_request_bytes: 1536 * 1024,
            max_size_per_msg: 1024 * 1024,
            max_inflight_msgs: 512,
            defrag_threshold_mb: 0,
            unsafe_no_fsync: false,
            v2_deprecation: V2DeprecationLevel::default(),
            peer_timeout: Duration::from_secs(10),
        }
    }

    pub fn member_dir(&self) -> PathBuf {
        self.data_dir.join("member")
    }

    pub fn snap_dir(&self) -> PathBuf {
        self.member_dir().join("snap")
    }

    pub fn wal_dir(&self) -> PathBuf {
        match &self.dedicated_wal_dir {
            Some(dir) => dir.clone(),
            None => self.member_dir().join("wal"),
        }
    }

    /// Location of the key-value backend.
    pub fn backend_path(&self) -> PathBuf {
        self.snap_dir().join("db")
    }

    /// Checks before forming a new cluster.
    pub fn verify_bootstrap(&self) -> Result<()> {
        self.has_local_member()?;
        self.advertise_matches_cluster()?;
        self.check_duplicate_urls()?;
        if self.initial_cluster.is_empty() && self.discovery_url.is_none() {
            return Err(TesseraError::InvalidConfig {
                field: "initial_cluster".to_string(),
                reason: "initial cluster unset and no discovery URL found".to_string(),
            });
        }
        Ok(())
    }

    /// Checks before joining a running cluster.
    pub fn verify_join_existing(&self) -> Result<()> {
        self.has_local_member()?;
        self.advertise_matches_cluster()?;
        self.check_duplicate_urls()?;
        if self.discovery_url.is_some() {
            return Err(TesseraError::InvalidConfig {
                field: "discovery_url".to_string(),
                reason: "discovery URL should not be set when joining existing initial cluster"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn has_local_member(&self) -> Result<()> {
        if !self.initial_cluster.contains(&self.name) {
            return Err(TesseraError::InvalidConfig {
                field: "initial_cluster".to_string(),
                reason: format!(
                    "couldn't find local name {:?} in the initial cluster configuration",
                    self.name
                ),
            });
        }
        Ok(())
    }

    fn advertise_matches_cluster(&self) -> Result<()> {
        let configured = self.initial_cluster.get(&self.name).unwrap_or_default();
        let advertised = self
            .advertise_peer_urls
            .iter()
            .map(|u| crate::membership::normalize_url(u))
            .collect::<Result<Vec<_>>>()?;

        if !urls_equal(configured, &advertised) {
            return Err(TesseraError::InvalidConfig {
                field: "advertise_peer_urls".to_string(),
                reason: format!(
                    "{:?} does not match {}={:?} in the initial cluster",
                    advertised, self.name, configured
                ),
            });
        }
        Ok(())
    }

    fn check_duplicate_urls(&self) -> Result<()> {
        if let Some(url) = self.initial_cluster.duplicate_url() {
            return Err(TesseraError::InvalidConfig {
                field: "initial_cluster".to_string(),
                reason: format!("initial cluster {} has duplicate url {}", self.initial_cluster, url),
            });
        }
        Ok(())
    }
}

/// Serde helper for humantime-style durations.
pub mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_members() -> ServerConfig {
        let mut cfg = ServerConfig::development("infra1", "/tmp/tessera");
        cfg.initial_cluster = "infra1=http://127.0.0.1:2380,infra2=http://127.0.0.1:2381,infra3=http://127.0.0.1:2382"
            .parse()
            .unwrap();
        cfg
    }

    #[test]
    fn test_development_config_is_valid() {
        let cfg = ServerConfig::development("infra1", "/tmp/tessera");
        cfg.validate().unwrap();
        cfg.verify_bootstrap().unwrap();
    }

    #[test]
    fn test_directory_layout() {
        let mut cfg = ServerConfig::development("infra1", "/var/lib/tessera");
        assert_eq!(cfg.member_dir(), PathBuf::from("/var/lib/tessera/member"));
        assert_eq!(cfg.snap_dir(), PathBuf::from("/var/lib/tessera/member/snap"));
        assert_eq!(cfg.backend_path(), PathBuf::from("/var/lib/tessera/member/snap/db"));
        assert_eq!(cfg.wal_dir(), PathBuf::from("/var/lib/tessera/member/wal"));

        cfg.dedicated_wal_dir = Some(PathBuf::from("/fast/wal"));
        assert_eq!(cfg.wal_dir(), PathBuf::from("/fast/wal"));
    }

    #[test]
    fn test_missing_local_member() {
        let mut cfg = three_members();
        cfg.name = "infra9".to_string();
        let err = cfg.verify_bootstrap().unwrap_err();
        assert!(err.to_string().contains("couldn't find local name"));
    }

    #[test]
    fn test_advertise_mismatch() {
        let mut cfg = three_members();
        cfg.advertise_peer_urls = vec!["http://127.0.0.1:9999".to_string()];
        assert!(cfg.verify_join_existing().is_err());
    }

    #[test]
    fn test_duplicate_urls_rejected() {
        let mut cfg = three_members();
        cfg.initial_cluster =
            "infra1=http://127.0.0.1:2380,infra2=http://127.0.0.1:2380".parse().unwrap();
        let err = cfg.verify_bootstrap().unwrap_err();
        assert!(err.to_string().contains("duplicate url"));
    }

    #[test]
    fn test_join_rejects_discovery() {
        let mut cfg = three_members();
        cfg.discovery_url = Some("http://discovery.local/abc".to_string());
        cfg.verify_bootstrap().unwrap();
        let err = cfg.verify_join_existing().unwrap_err();
        assert!(err.to_string().contains("discovery URL should not be set"));
    }

    #[test]
    fn test_from_file_roundtrip_and_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tessera.json");
        let cfg = three_members();
        std::fs::write(&path, serde_json::to_string_pretty(&cfg).unwrap()).unwrap();

        let loaded = ServerConfig::from_file(&path).unwrap();
        assert_eq!(loaded.initial_cluster, cfg.initial_cluster);
        assert_eq!(loaded.tick, Duration::from_millis(100));
        assert_eq!(loaded.peer_timeout, Duration::from_secs(10));

        let mut bad = cfg.clone();
        bad.election_ticks = 1;
        std::fs::write(&path, serde_json::to_string(&bad).unwrap()).unwrap();
        assert!(matches!(
            ServerConfig::from_file(&path),
            Err(TesseraError::InvalidConfig { .. })
        ));
    }
}
