//! symx - mirror Apple firmware artifacts and extract their debug symbols.
//!
//! # Overview
//!
//! symx is the worker binary of a continuously-running fleet: it indexes
//! OTA and IPSW releases from Apple and AppleDB, mirrors the artifacts
//! into an object store, and extracts `dyld_shared_cache` symbols into a
//! debug-id-addressed symbol store. All coordination happens through
//! CAS-protected metadata documents in the store itself; any number of
//! workers may run concurrently.

/// Command implementations.
pub mod cmd;

use clap::{Parser, Subcommand};

/// Default wall-clock budget in minutes, sized below CI runner limits.
const DEFAULT_TIMEOUT: u64 = symx_core::budget::DEFAULT_TIMEOUT_MINUTES;

/// Top-level command line of the `symx` worker.
#[derive(Debug, Parser)]
#[command(name = "symx")]
#[command(author, version, about = "Apple firmware mirror and symbol extraction fleet")]
pub struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Workflow-run identifier recorded on every metadata mutation
    /// (falls back to $GITHUB_RUN_ID, then 0)
    #[arg(long, global = true)]
    pub run_id: Option<u64>,

    /// The domain to operate on.
    #[command(subcommand)]
    pub command: Commands,
}

/// Artifact domains.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// OTA update packages
    #[command(subcommand)]
    Ota(OtaCommands),
    /// IPSW restore images
    #[command(subcommand)]
    Ipsw(IpswCommands),
    /// Simulator runtime images on this host
    #[command(subcommand)]
    Sim(SimCommands),
}

/// Stages of the OTA pipeline.
#[derive(Debug, Subcommand)]
pub enum OtaCommands {
    /// Index current OTA releases and mirror them to storage
    Mirror {
        /// URI to a supported storage backend (gs://[project@]bucket)
        #[arg(short, long)]
        storage: String,
        /// Timeout in minutes triggering an ordered shutdown after it elapsed
        #[arg(short, long, default_value_t = DEFAULT_TIMEOUT)]
        timeout: u64,
    },
    /// Extract dyld_shared_cache symbols from mirrored OTA images
    Extract {
        /// URI to a supported storage backend (gs://[project@]bucket)
        #[arg(short, long)]
        storage: String,
        /// Timeout in minutes triggering an ordered shutdown after it elapsed
        #[arg(short, long, default_value_t = DEFAULT_TIMEOUT)]
        timeout: u64,
    },
}

/// Stages of the IPSW pipeline.
#[derive(Debug, Subcommand)]
pub enum IpswCommands {
    /// Synchronize IPSW meta-data with AppleDB
    MetaSync {
        /// URI to a supported storage backend (gs://[project@]bucket)
        #[arg(short, long)]
        storage: String,
    },
    /// Mirror indexed IPSW images to storage
    Mirror {
        /// URI to a supported storage backend (gs://[project@]bucket)
        #[arg(short, long)]
        storage: String,
        /// Timeout in minutes triggering an ordered shutdown after it elapsed
        #[arg(short, long, default_value_t = DEFAULT_TIMEOUT)]
        timeout: u64,
    },
    /// Extract dyld_shared_cache symbols from mirrored IPSW images
    Extract {
        /// URI to a supported storage backend (gs://[project@]bucket)
        #[arg(short, long)]
        storage: String,
        /// Timeout in minutes triggering an ordered shutdown after it elapsed
        #[arg(short, long, default_value_t = DEFAULT_TIMEOUT)]
        timeout: u64,
    },
}

/// Simulator-runtime operations.
#[derive(Debug, Subcommand)]
pub enum SimCommands {
    /// Extract symbols from simulator runtime images on this host
    Extract {
        /// URI to a supported storage backend (gs://[project@]bucket)
        #[arg(short, long)]
        storage: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ota_mirror_invocation() {
        let cli = Cli::try_parse_from([
            "symx", "ota", "mirror", "--storage", "gs://proj@bucket", "--timeout", "30",
        ])
        .unwrap();
        match cli.command {
            Commands::Ota(OtaCommands::Mirror { storage, timeout }) => {
                assert_eq!(storage, "gs://proj@bucket");
                assert_eq!(timeout, 30);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn timeout_defaults_below_runner_limit() {
        let cli =
            Cli::try_parse_from(["symx", "ipsw", "mirror", "--storage", "gs://bucket"]).unwrap();
        match cli.command {
            Commands::Ipsw(IpswCommands::Mirror { timeout, .. }) => assert_eq!(timeout, 345),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn verbose_flag_is_global() {
        let cli = Cli::try_parse_from([
            "symx", "ipsw", "meta-sync", "--storage", "gs://bucket", "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
    }
}
