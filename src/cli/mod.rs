//! Command-line interface for tessera.

use crate::config::ServerConfig;
use crate::error::Result;
use crate::membership::UrlsMap;
use crate::observability::LogConfig;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Tessera - bootstrap a replica of a Raft-replicated key-value store.
#[derive(Parser)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "TESSERA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "TESSERA_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "TESSERA_LOG_JSON")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Bootstrap this replica from its data directory and report the outcome
    Bootstrap(BootstrapArgs),

    /// Show version information
    Version,
}

/// Whether the initial cluster is being formed or already runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ClusterState {
    New,
    Existing,
}

/// Overrides applied on top of the configuration file.
#[derive(Debug, clap::Args)]
pub struct BootstrapArgs {
    /// Member name
    #[arg(long, env = "TESSERA_NAME")]
    pub name: Option<String>,

    /// Data directory
    #[arg(long, env = "TESSERA_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Dedicated WAL directory
    #[arg(long, env = "TESSERA_WAL_DIR")]
    pub wal_dir: Option<PathBuf>,

    /// Advertised peer URLs (comma separated)
    #[arg(long, env = "TESSERA_ADVERTISE_PEER_URLS", value_delimiter = ',')]
    pub advertise_peer_urls: Vec<String>,

    /// Initial cluster (name=url,...)
    #[arg(long, env = "TESSERA_INITIAL_CLUSTER")]
    pub initial_cluster: Option<String>,

    /// Initial cluster token
    #[arg(long, env = "TESSERA_INITIAL_CLUSTER_TOKEN")]
    pub initial_cluster_token: Option<String>,

    /// Initial cluster state
    #[arg(long, value_enum, env = "TESSERA_INITIAL_CLUSTER_STATE")]
    pub initial_cluster_state: Option<ClusterState>,

    /// Discovery service URL
    #[arg(long, env = "TESSERA_DISCOVERY")]
    pub discovery: Option<String>,

    /// Restart as a single-member cluster, discarding uncommitted entries
    #[arg(long)]
    pub force_new_cluster: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            log_level: self.log_level.clone(),
            json_logs: self.json_logs,
        }
    }
}

impl BootstrapArgs {
    /// Apply these overrides to `cfg` and validate the result.
    pub fn apply(&self, mut cfg: ServerConfig) -> Result<ServerConfig> {
        if let Some(name) = &self.name {
            cfg.name = name.clone();
        }
        if let Some(dir) = &self.data_dir {
            cfg.data_dir = dir.clone();
        }
        if let Some(dir) = &self.wal_dir {
            cfg.dedicated_wal_dir = Some(dir.clone());
        }
        if !self.advertise_peer_urls.is_empty() {
            cfg.advertise_peer_urls = self.advertise_peer_urls.clone();
        }
        if let Some(ic) = &self.initial_cluster {
            cfg.initial_cluster = ic.parse::<UrlsMap>()?;
        }
        if let Some(token) = &self.initial_cluster_token {
            cfg.initial_cluster_token = token.clone();
        }
        if let Some(state) = self.initial_cluster_state {
            cfg.new_cluster = state == ClusterState::New;
        }
        if let Some(url) = &self.discovery {
            cfg.discovery_url = Some(url.clone());
        }
        if self.force_new_cluster {
            cfg.force_new_cluster = true;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}
