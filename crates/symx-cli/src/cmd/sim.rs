//! `symx sim` commands.

use anyhow::Result;

use symx_core::sim::extract_simulator_symbols;
use symx_core::tools;

/// Extract symbols from the simulator runtimes installed on this host.
pub async fn extract(storage: &str) -> Result<()> {
    let store = super::init_storage(storage)?;
    tools::validate_shell_deps().await?;

    extract_simulator_symbols(store).await?;
    Ok(())
}
