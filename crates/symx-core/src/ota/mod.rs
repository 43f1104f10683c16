//! OTA pipeline: index from Apple, mirror to storage, extract symbols.
//!
//! What Apple considers identity, what suffices for the symbol store, and
//! how to migrate when identities change is all encoded in the schema
//! crate's merge protocol; this module feeds it and executes the mirror
//! and extract stages against the metadata store.

/// Extract stage for OTA artifacts.
pub mod extract;

use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use symx_schema::{ArtifactProcessingState, OtaArtifact, OtaMetaData};

use crate::budget::RunBudget;
use crate::meta::{MetaError, OtaMetaStore};
use crate::mirror::{upload_mirror_blob, MirrorUploadOutcome};
use crate::net::{self, DownloadError};
use crate::store::{ObjectStore, StoreError};
use crate::tools::{self, ToolError, ToolOutput};

pub use extract::OtaExtract;

/// Platforms Apple serves OTA update feeds for.
pub const OTA_PLATFORMS: [&str; 8] = [
    "ios",
    "watchos",
    "tvos",
    "audioos",
    "accessory",
    "macos",
    "recovery",
    "visionos",
];

/// Errors raised by the OTA index and mirror stages.
#[derive(Error, Debug)]
pub enum OtaError {
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

    /// Scratch-directory trouble.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Apple reports its hashes with an algorithm we don't speak.
    #[error("unexpected hash-algo: {0}")]
    UnexpectedHashAlgorithm(String),
}

/// One record of the `ipsw download ota --urls --json` output.
#[derive(Debug, Deserialize)]
struct OtaUrlRecord {
    url: String,
    build: String,
    version: String,
    hash: String,
    hash_algorithm: String,
    #[serde(default)]
    devices: Vec<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Parse one platform/channel's URL-list output into `meta`.
///
/// A non-zero exit with "403 Forbidden" in stderr is an intermittent
/// Apple availability issue and only worth a warning; other failures are
/// logged as errors but still don't abort the sync -- a partial index is
/// better than none. Betas can share a zip-id with the later release, so
/// their key is tagged `_beta` and the merge protocol pairs them up.
pub fn parse_download_meta_output(
    platform: &str,
    output: &ToolOutput,
    meta: &mut OtaMetaData,
    beta: bool,
    run_id: u64,
) {
    if !output.success() {
        if output.stderr.contains("api returned status: 403 Forbidden") {
            tracing::warn!(platform, beta, "Apple returned 403 for OTA meta download");
        } else {
            tracing::error!(platform, beta, stderr = %output.stderr, "download meta failed");
        }
        return;
    }

    let records: Vec<OtaUrlRecord> = match serde_json::from_str(&output.stdout) {
        Ok(records) => records,
        Err(err) => {
            tracing::error!(platform, beta, error = %err, "unparsable OTA meta output");
            return;
        }
    };

    for record in records {
        let zip_stem = record
            .url
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .trim_end_matches(".zip");
        if zip_stem.len() != 40 {
            tracing::error!(url = %record.url, "unexpected url-format in OTA meta item");
        }

        let key = if beta {
            format!("{zip_stem}_beta")
        } else {
            zip_stem.to_string()
        };

        meta.insert(
            key,
            OtaArtifact {
                id: zip_stem.to_string(),
                build: record.build,
                version: record.version,
                platform: platform.to_string(),
                url: record.url,
                hash: record.hash,
                hash_algorithm: record.hash_algorithm,
                description: record.description.into_iter().collect(),
                devices: record.devices,
                download_path: None,
                processing_state: ArtifactProcessingState::Indexed,
                last_run: run_id,
            },
        );
    }
}

/// Ask Apple for the current OTA metadata of every platform and channel.
pub async fn retrieve_current_meta(run_id: u64) -> Result<OtaMetaData, ToolError> {
    let mut meta = OtaMetaData::new();
    for platform in OTA_PLATFORMS {
        tracing::info!(platform, "downloading OTA meta");
        let output = tools::ipsw::download_ota_urls(platform, false).await?;
        parse_download_meta_output(platform, &output, &mut meta, false, run_id);

        let output = tools::ipsw::download_ota_urls(platform, true).await?;
        parse_download_meta_output(platform, &output, &mut meta, true, run_id);
    }
    Ok(meta)
}

/// Mirror key of an OTA artifact.
pub fn mirror_key(ota: &OtaArtifact) -> String {
    format!(
        "mirror/ota/{}/{}/{}/{}.zip",
        ota.platform, ota.version, ota.build, ota.id
    )
}

/// Verify a downloaded OTA against its recorded hash.
pub async fn check_ota_hash(ota: &OtaArtifact, path: &std::path::Path) -> Result<bool, OtaError> {
    if ota.hash_algorithm != "SHA-1" {
        return Err(OtaError::UnexpectedHashAlgorithm(ota.hash_algorithm.clone()));
    }
    Ok(net::check_sha1(&ota.hash, path).await?)
}

/// Index + mirror stage for the OTA domain.
pub struct OtaMirror {
    store: Arc<dyn ObjectStore>,
    meta: OtaMetaStore,
    run_id: u64,
}

impl std::fmt::Debug for OtaMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtaMirror")
            .field("store", &self.store.name())
            .finish()
    }
}

impl OtaMirror {
    /// A mirror worker against `store`, stamping mutations with `run_id`.
    pub fn new(store: Arc<dyn ObjectStore>, run_id: u64) -> Self {
        OtaMirror {
            meta: OtaMetaStore::new(store.clone()),
            store,
            run_id,
        }
    }

    /// Run the index stage: pull Apple's current view and merge it in.
    pub async fn update_meta(&self) -> Result<OtaMetaData, OtaError> {
        tracing::debug!("updating OTA meta-data");
        let apple_meta = retrieve_current_meta(self.run_id).await?;
        Ok(self.meta.merge_from_upstream(&apple_meta).await?)
    }

    /// Run index + mirror until done or the budget elapses.
    pub async fn mirror(&self, budget: &RunBudget) -> Result<(), OtaError> {
        tracing::debug!(storage = self.store.name(), "mirroring OTA images");
        let meta = self.update_meta().await?;

        let download_dir = tempfile::tempdir()?;
        for (key, ota) in &meta {
            if budget.expired() {
                tracing::info!(elapsed = ?budget.elapsed(), "exiting OTA mirror due to elapsed timeout");
                return Ok(());
            }
            if !ota.processing_state.is_mirrorable() {
                continue;
            }

            if let Err(err) = self.mirror_one(key, ota, download_dir.path()).await {
                // One bad artifact must not keep the rest from mirroring.
                tracing::error!(%key, error = %err, "failed to mirror OTA");
                let mut failed = ota.clone();
                failed.processing_state = ArtifactProcessingState::IndexedInvalid;
                failed.last_run = self.run_id;
                self.meta.update_item(key, &failed).await?;
            }
        }
        Ok(())
    }

    async fn mirror_one(
        &self,
        key: &str,
        ota: &OtaArtifact,
        download_dir: &std::path::Path,
    ) -> Result<(), OtaError> {
        tracing::info!(key, url = %ota.url, "downloading OTA");
        let local_path = download_dir.join(format!(
            "{}_{}_{}_{}.zip",
            ota.platform, ota.version, ota.build, ota.id
        ));
        net::download_url_to_file(&ota.url, &local_path).await?;

        let mut updated = ota.clone();
        updated.last_run = self.run_id;

        if !check_ota_hash(ota, &local_path).await? {
            tracing::error!(key, url = %ota.url, "downloaded OTA does not match its recorded hash");
            updated.processing_state = ArtifactProcessingState::MirroringFailed;
            self.meta.update_item(key, &updated).await?;
            tokio::fs::remove_file(&local_path).await?;
            return Ok(());
        }

        let destination = mirror_key(ota);
        match upload_mirror_blob(self.store.as_ref(), &destination, &local_path).await? {
            MirrorUploadOutcome::Stored | MirrorUploadOutcome::AlreadyPresent => {
                updated.download_path = Some(destination);
                updated.processing_state = ArtifactProcessingState::Mirrored;
            }
            MirrorUploadOutcome::ContentMismatch => {
                tracing::error!(
                    key = %destination,
                    "mirror blob exists with a different MD5"
                );
                updated.processing_state = ArtifactProcessingState::MirroringFailed;
            }
        }
        self.meta.update_item(key, &updated).await?;
        tokio::fs::remove_file(&local_path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(code: i32, stdout: &str, stderr: &str) -> ToolOutput {
        ToolOutput {
            code: Some(code),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    const ZIP_ID: &str = "abc123def4567890123456789012345678901234";

    fn meta_json() -> String {
        format!(
            r#"[{{
                "url": "https://updates.cdn-apple.com/patches/{ZIP_ID}.zip",
                "build": "21A100",
                "version": "17.0",
                "hash": "somehash",
                "hash_algorithm": "SHA-1",
                "devices": ["iPhone14,7"],
                "description": "iOS 17.0"
            }}]"#
        )
    }

    #[test]
    fn parses_successful_meta_output() {
        let mut meta = OtaMetaData::new();
        parse_download_meta_output("ios", &output(0, &meta_json(), ""), &mut meta, false, 7);

        let artifact = &meta[ZIP_ID];
        assert_eq!(artifact.id, ZIP_ID);
        assert_eq!(artifact.build, "21A100");
        assert_eq!(artifact.platform, "ios");
        assert_eq!(artifact.devices, vec!["iPhone14,7"]);
        assert_eq!(artifact.description, vec!["iOS 17.0"]);
        assert_eq!(artifact.processing_state, ArtifactProcessingState::Indexed);
        assert_eq!(artifact.last_run, 7);
    }

    #[test]
    fn beta_records_get_tagged_keys() {
        let mut meta = OtaMetaData::new();
        parse_download_meta_output("ios", &output(0, &meta_json(), ""), &mut meta, true, 7);

        let key = format!("{ZIP_ID}_beta");
        assert!(meta.contains_key(&key));
        // The id stays the plain zip stem; only the key is tagged.
        assert_eq!(meta[&key].id, ZIP_ID);
    }

    #[test]
    fn forbidden_channel_is_skipped_quietly() {
        let mut meta = OtaMetaData::new();
        let failed = output(1, "", "api returned status: 403 Forbidden");
        parse_download_meta_output("ios", &failed, &mut meta, false, 7);
        assert!(meta.is_empty());
    }

    #[test]
    fn unparsable_output_does_not_panic() {
        let mut meta = OtaMetaData::new();
        parse_download_meta_output("ios", &output(0, "not json", ""), &mut meta, false, 7);
        assert!(meta.is_empty());
    }

    #[test]
    fn mirror_key_layout() {
        let ota = OtaArtifact {
            id: ZIP_ID.to_string(),
            build: "21C66".into(),
            version: "17.2.1".into(),
            platform: "ios".into(),
            url: String::new(),
            hash: String::new(),
            hash_algorithm: "SHA-1".into(),
            description: Vec::new(),
            devices: Vec::new(),
            download_path: None,
            processing_state: ArtifactProcessingState::Indexed,
            last_run: 0,
        };
        assert_eq!(
            mirror_key(&ota),
            format!("mirror/ota/ios/17.2.1/21C66/{ZIP_ID}.zip")
        );
    }
}
