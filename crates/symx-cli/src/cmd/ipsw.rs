//! `symx ipsw` commands.

use anyhow::Result;

use symx_core::budget::RunBudget;
use symx_core::ipsw::{AppleDbImporter, IpswExtract, IpswMirror};
use symx_core::tools;

/// Synchronize IPSW meta-data with AppleDB.
pub async fn meta_sync(storage: &str, run_id: u64) -> Result<()> {
    let store = super::init_storage(storage)?;

    let work_dir = tempfile::tempdir()?;
    let stats = AppleDbImporter::new(store, run_id).run(work_dir.path()).await?;
    tracing::info!(?stats, "meta-sync finished");
    Ok(())
}

/// Run the IPSW mirror stage.
pub async fn mirror(storage: &str, timeout_minutes: u64, run_id: u64) -> Result<()> {
    let store = super::init_storage(storage)?;
    tools::validate_shell_deps().await?;

    let budget = RunBudget::minutes(timeout_minutes);
    IpswMirror::new(store, run_id).mirror(&budget).await?;
    Ok(())
}

/// Run the IPSW extract stage.
pub async fn extract(storage: &str, timeout_minutes: u64, run_id: u64) -> Result<()> {
    let store = super::init_storage(storage)?;
    tools::validate_shell_deps().await?;

    let budget = RunBudget::minutes(timeout_minutes);
    IpswExtract::new(store, run_id).extract(&budget).await?;
    Ok(())
}
