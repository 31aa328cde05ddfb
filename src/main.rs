//! Tessera CLI - Main entry point.

use std::process::ExitCode;
use tessera::cli::{Cli, Commands};
use tessera::config::ServerConfig;
use tessera::version::{MIN_CLUSTER_VERSION, SERVER_VERSION};
use tracing::error;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse_args();

    match &cli.command {
        Commands::Bootstrap(args) => {
            tessera::observability::init(&cli.log_config())?;

            let base = match &cli.config {
                Some(path) => ServerConfig::from_file(path)?,
                None => {
                    let name = args.name.clone().unwrap_or_else(|| "default".to_string());
                    let data_dir = args
                        .data_dir
                        .clone()
                        .unwrap_or_else(|| format!("{}.tessera", name).into());
                    ServerConfig::development(&name, data_dir)
                }
            };
            let config = args.apply(base)?;

            match tessera::bootstrap(&config).await {
                Ok(server) => {
                    println!("Bootstrapped member {}", server.node_id());
                    println!("  Cluster:  {}", server.cluster_id());
                    println!("  Path:     {:?}", server.path);
                    if let Some(status) = server.status() {
                        println!("  Term:     {}", status.hard_state.term);
                        println!("  Commit:   {}", status.hard_state.commit);
                        println!("  Voters:   {:?}", status.voters);
                    }
                    server.close()?;
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Bootstrap aborted");
                    return Ok(ExitCode::FAILURE);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Commands::Version => {
            println!("tessera {}", SERVER_VERSION);
            println!("  Minimum cluster version: {}", MIN_CLUSTER_VERSION);
        }
    }

    Ok(ExitCode::SUCCESS)
}
