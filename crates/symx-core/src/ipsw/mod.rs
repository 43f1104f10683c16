//! IPSW pipeline: AppleDB index sync, mirror, and extract stages.

/// AppleDB repository import (the IPSW index stage).
pub mod appledb;
/// Extract stage for IPSW restore images.
pub mod extract;
/// Mirror stage for IPSW restore images.
pub mod mirror;

use thiserror::Error;

use symx_schema::{IpswArtifact, IpswSource};

use crate::dsc::ExtractError;
use crate::meta::MetaError;
use crate::net::DownloadError;
use crate::store::StoreError;
use crate::tools::ToolError;

pub use appledb::{AppleDbImporter, ImportStats};
pub use extract::IpswExtract;
pub use mirror::IpswMirror;

/// Errors raised by the IPSW stages.
#[derive(Error, Debug)]
pub enum IpswError {
    /// A metadata-document operation failed.
    #[error(transparent)]
    Meta(#[from] MetaError),

    /// The object store failed underneath us.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A toolchain invocation failed.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// An Apple CDN download failed for good.
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// The extraction machinery failed.
    #[error(transparent)]
    Extract(#[from] ExtractError),

    /// Scratch-directory trouble.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mirror key of one IPSW source.
pub fn mirror_key(artifact: &IpswArtifact, source: &IpswSource) -> String {
    format!(
        "mirror/ipsw/{}/{}/{}/{}",
        artifact.platform,
        artifact.version,
        artifact.build,
        source.file_name()
    )
}

/// Symsorter bundle id of one IPSW source: the file stem with commas
/// flattened, stable across runs.
pub fn bundle_id(source: &IpswSource) -> String {
    let file_name = source.file_name();
    let stem = file_name.strip_suffix(".ipsw").unwrap_or(&file_name);
    format!("ipsw_{}", stem.replace(',', "_"))
}
