//! Command implementations wiring CLI flags to pipeline stages.

/// IPSW commands.
pub mod ipsw;
/// OTA commands.
pub mod ota;
/// Simulator commands.
pub mod sim;

use std::sync::Arc;

use anyhow::{anyhow, Result};

use symx_core::store::{GcsStore, ObjectStore, StorageUri};

/// Build the object store named by a `gs://[project@]bucket` URI.
pub fn init_storage(storage: &str) -> Result<Arc<dyn ObjectStore>> {
    let uri = StorageUri::parse(storage).map_err(|message| anyhow!(message))?;
    Ok(Arc::new(GcsStore::new(&uri)))
}
