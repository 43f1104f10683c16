//! Shared data model for the symx symbol-mirror pipeline.
//!
//! This crate defines the canonical data structures used across all symx
//! components: the artifact processing-state machine, the OTA and IPSW
//! artifact schemas with their merge protocol and duplicate rule, and the
//! candidate filters used by the mirror and extract workflows. It is pure
//! data and logic -- no I/O lives here.

/// CPU architectures a `dyld_shared_cache` can be built for.
pub mod arch;
/// Candidate filters and ordering for the mirror/extract workflows.
pub mod filters;
/// IPSW artifact schema: platforms, sources, and the metadata envelope.
pub mod ipsw;
/// OTA artifact schema and the metadata merge protocol.
pub mod ota;
/// The per-source processing-state machine.
pub mod state;

pub use arch::Arch;
pub use ipsw::{
    significant_diff, IpswArtifact, IpswArtifactDb, IpswArtifactHashes, IpswPlatform,
    IpswReleaseStatus, IpswSource,
};
pub use ota::{merge_meta_data, MergeError, OtaArtifact, OtaMetaData};
pub use state::ArtifactProcessingState;

/// Object-store key of the OTA metadata document.
pub const OTA_META_JSON: &str = "ota_image_meta.json";

/// Object-store key of the IPSW metadata document.
pub const IPSW_META_JSON: &str = "ipsw_meta.json";

/// Object-store key of the AppleDB import-state document.
pub const IMPORT_STATE_JSON: &str = "appledb_import_state.json";
