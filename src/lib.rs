//! Tessera - replica bootstrap for a Raft-replicated key-value store.
//!
//! A replica starting up may find anything on disk: nothing at all, a log
//! from a previous run, a torn log tail, a backend that lags the newest
//! snapshot. Tessera turns that state into a running consensus engine plus
//! the storage it needs, or refuses with a precise error.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        bootstrap()                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Backend: open | defrag | recover from snapshot | schema    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Cluster: join existing | form new | restart from log       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Log: WAL open | single repair | forced recovery            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Engine: start with peers | restart from storage            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use tessera::config::ServerConfig;
//!
//! #[tokio::main]
//! async fn main() -> tessera::Result<()> {
//!     let config = ServerConfig::development("infra1", "/tmp/tessera");
//!     let server = tessera::bootstrap(&config).await?;
//!     println!("member {} of cluster {}", server.node_id(), server.cluster_id());
//!     server.close()
//! }
//! ```

pub mod config;
pub mod error;
pub mod types;
pub mod version;

pub mod backend;
pub mod bootstrap;
pub mod membership;
pub mod peer;
pub mod raft;
pub mod snap;
pub mod v2store;
pub mod wal;

pub mod cli;
pub mod observability;

// Re-exports
pub use bootstrap::{bootstrap, BootstrapPath, BootstrappedServer};
pub use error::{Result, TesseraError};
pub use types::*;
