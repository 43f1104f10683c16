//! `symx ota` commands.

use anyhow::Result;

use symx_core::budget::RunBudget;
use symx_core::ota::{OtaExtract, OtaMirror};
use symx_core::tools;

/// Run the OTA index + mirror stage.
pub async fn mirror(storage: &str, timeout_minutes: u64, run_id: u64) -> Result<()> {
    let store = super::init_storage(storage)?;
    tools::validate_shell_deps().await?;

    let budget = RunBudget::minutes(timeout_minutes);
    OtaMirror::new(store, run_id).mirror(&budget).await?;
    Ok(())
}

/// Run the OTA extract stage.
pub async fn extract(storage: &str, timeout_minutes: u64, run_id: u64) -> Result<()> {
    let store = super::init_storage(storage)?;
    tools::validate_shell_deps().await?;

    let budget = RunBudget::minutes(timeout_minutes);
    OtaExtract::new(store, run_id).extract(&budget).await?;
    Ok(())
}
