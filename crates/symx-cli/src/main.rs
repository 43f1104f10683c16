//! symx worker entrypoint.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use symx_cli::{cmd, Cli, Commands, IpswCommands, OtaCommands, SimCommands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    // The workflow-run id is captured once here and threaded through as a
    // plain value; nothing else reads the environment.
    let run_id = cli.run_id.unwrap_or_else(|| {
        std::env::var("GITHUB_RUN_ID")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    });

    match cli.command {
        Commands::Ota(OtaCommands::Mirror { storage, timeout }) => {
            cmd::ota::mirror(&storage, timeout, run_id).await
        }
        Commands::Ota(OtaCommands::Extract { storage, timeout }) => {
            cmd::ota::extract(&storage, timeout, run_id).await
        }
        Commands::Ipsw(IpswCommands::MetaSync { storage }) => {
            cmd::ipsw::meta_sync(&storage, run_id).await
        }
        Commands::Ipsw(IpswCommands::Mirror { storage, timeout }) => {
            cmd::ipsw::mirror(&storage, timeout, run_id).await
        }
        Commands::Ipsw(IpswCommands::Extract { storage, timeout }) => {
            cmd::ipsw::extract(&storage, timeout, run_id).await
        }
        Commands::Sim(SimCommands::Extract { storage }) => cmd::sim::extract(&storage).await,
    }
}
