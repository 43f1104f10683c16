//! OTA extract stage: mirrored zip in, symbol bundle out.
//!
//! The packaging decides the path: newer OTAs are cryptex containers
//! whose system DMG must be patched out and mounted; legacy OTAs carry
//! the DSC directly in the zip. Both paths converge on split -> symsort
//! -> upload.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use symx_schema::{ArtifactProcessingState, OtaArtifact};

use crate::budget::RunBudget;
use crate::dsc::{self, ExtractError};
use crate::meta::{MetaError, OtaMetaStore};
use crate::ota::{check_ota_hash, OtaError};
use crate::store::ObjectStore;
use crate::symbols::{self, SymbolUploadSummary};
use crate::tools;

/// The cryptex image that carries the shared cache.
const CRYPTEX_SYSTEM_IMAGE: &str = "cryptex-system-arm64e";

/// Extract stage for the OTA domain.
pub struct OtaExtract {
    store: Arc<dyn ObjectStore>,
    meta: OtaMetaStore,
    run_id: u64,
}

impl std::fmt::Debug for OtaExtract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtaExtract")
            .field("store", &self.store.name())
            .finish()
    }
}

impl OtaExtract {
    /// An extract worker against `store`, stamping mutations with `run_id`.
    pub fn new(store: Arc<dyn ObjectStore>, run_id: u64) -> Self {
        OtaExtract {
            meta: OtaMetaStore::new(store.clone()),
            store,
            run_id,
        }
    }

    /// Find the next mirrored artifact, reloading the document first.
    ///
    /// Reloading on every call is deliberate: concurrent workers mutate
    /// the document between iterations, and yielding a stale candidate
    /// wastes multi-minute subprocess work on an artifact someone else
    /// already owns.
    async fn next_mirrored(&self) -> Result<Option<(String, OtaArtifact)>, MetaError> {
        let (meta, _) = self.meta.load().await?;
        Ok(meta
            .into_iter()
            .find(|(_, ota)| ota.processing_state.is_extractable()))
    }

    /// Run the extract loop until no candidates remain or the budget
    /// elapses.
    pub async fn extract(&self, budget: &RunBudget) -> Result<(), OtaError> {
        tracing::debug!(storage = self.store.name(), "extracting symbols from OTA images");

        loop {
            if budget.expired() {
                tracing::warn!(elapsed = ?budget.elapsed(), "exiting OTA extract due to elapsed timeout");
                return Ok(());
            }
            let Some((key, ota)) = self.next_mirrored().await? else {
                tracing::info!("no more mirrored OTAs, exiting");
                return Ok(());
            };

            let work_dir = tempfile::tempdir()?;
            self.process_one(&key, &ota, work_dir.path()).await?;
        }
    }

    /// Process a single mirrored artifact; failures are recorded in its
    /// state so they never block the next candidate.
    async fn process_one(
        &self,
        key: &str,
        ota: &OtaArtifact,
        work_dir: &Path,
    ) -> Result<(), OtaError> {
        tracing::debug!(key, "downloading mirrored OTA to scratch");
        let Some(local_ota) = self.load_mirrored(ota, work_dir).await? else {
            tracing::error!(key, "mirror blob missing or corrupt");
            self.mark(key, ota, ArtifactProcessingState::MirrorCorrupt)
                .await?;
            return Ok(());
        };

        match self.extract_symbols(&local_ota, key, ota, work_dir).await {
            Ok(summary) => {
                let state = if summary.bundle_collision {
                    ArtifactProcessingState::BundleDuplicationDetected
                } else {
                    ArtifactProcessingState::SymbolsExtracted
                };
                self.mark(key, ota, state).await?;
            }
            Err(ExtractError::NoDscFound(_) | ExtractError::PartialUpdate) => {
                tracing::warn!(key, "no dyld_shared_cache in OTA (partial update?)");
                self.mark(key, ota, ArtifactProcessingState::DscExtractionFailed)
                    .await?;
            }
            Err(err) => {
                tracing::warn!(key, error = %err, "failed to extract symbols from OTA");
                self.mark(key, ota, ArtifactProcessingState::SymbolExtractionFailed)
                    .await?;
            }
        }
        Ok(())
    }

    /// Fetch the mirrored blob into scratch and re-verify it.
    async fn load_mirrored(
        &self,
        ota: &OtaArtifact,
        work_dir: &Path,
    ) -> Result<Option<PathBuf>, OtaError> {
        let Some(download_path) = ota.download_path.as_deref() else {
            return Ok(None);
        };
        let local_path = work_dir.join(format!("{}.zip", ota.id));
        if !self.store.download_to_path(download_path, &local_path).await? {
            return Ok(None);
        }
        if !check_ota_hash(ota, &local_path).await? {
            tracing::error!(
                download_path,
                "SHA-1 mismatch between mirror blob and meta-data"
            );
            return Ok(None);
        }
        Ok(Some(local_path))
    }

    async fn mark(
        &self,
        key: &str,
        ota: &OtaArtifact,
        state: ArtifactProcessingState,
    ) -> Result<(), MetaError> {
        let mut updated = ota.clone();
        updated.processing_state = state;
        updated.last_run = self.run_id;
        self.meta.update_item(key, &updated).await
    }

    /// Dispatch on packaging and produce + upload the symbol bundle.
    async fn extract_symbols(
        &self,
        local_ota: &Path,
        key: &str,
        ota: &OtaArtifact,
        work_dir: &Path,
    ) -> Result<SymbolUploadSummary, ExtractError> {
        if let Some(summary) = self.try_cryptex(local_ota, key, ota, work_dir).await? {
            return Ok(summary);
        }
        tracing::info!(key, "not a cryptex, extracting OTA dyld_shared_cache directly");
        self.process_legacy(local_ota, key, ota, work_dir).await
    }

    /// Cryptex path: patch out the DMGs, mount the system image, split
    /// the caches found on the volume. Returns `None` for non-cryptex
    /// OTAs.
    async fn try_cryptex(
        &self,
        local_ota: &Path,
        key: &str,
        ota: &OtaArtifact,
        work_dir: &Path,
    ) -> Result<Option<SymbolUploadSummary>, ExtractError> {
        let patch_dir = tempfile::tempdir()?;
        tracing::info!(key, "trying cryptex patch");
        let dmgs = tools::ipsw::ota_patch(local_ota, patch_dir.path()).await?;
        if dmgs.is_empty() {
            return Ok(None);
        }

        let Some(system_dmg) = dmgs.get(CRYPTEX_SYSTEM_IMAGE) else {
            tracing::warn!(key, "cryptex patch emitted no {CRYPTEX_SYSTEM_IMAGE} image");
            return Err(ExtractError::NoDscFound(local_ota.to_path_buf()));
        };

        tracing::info!(key, "cryptex patch successful, mounting system image");
        let mount = tools::dmg::mount_dmg(system_dmg).await?;
        let split_result = match dsc::find_dsc(&mount.point, &ota.version, &ota.build, work_dir) {
            Ok(results) => dsc::split_dsc(&results, dsc::ipsw_splitter()).await,
            Err(err) => Err(err),
        };
        // The volume must come down even when the split failed.
        tools::dmg::detach_dev(&mount.dev).await?;
        let split_dirs = split_result?;

        Ok(Some(self.symsort_and_upload(&split_dirs, key, ota, work_dir).await?))
    }

    /// Legacy path: the DSC sits in the zip itself.
    async fn process_legacy(
        &self,
        local_ota: &Path,
        key: &str,
        ota: &OtaArtifact,
        work_dir: &Path,
    ) -> Result<SymbolUploadSummary, ExtractError> {
        let extract_dir = tempfile::tempdir()?;
        let output = tools::ipsw::ota_extract(local_ota, extract_dir.path()).await?;

        let extract_dirs = list_dirs(extract_dir.path())?;
        if extract_dirs.is_empty() {
            // Exit 1 without an extraction directory means the zip is a
            // partial update that simply carries no DSC.
            if output.code == Some(1) {
                return Err(ExtractError::PartialUpdate);
            }
            return Err(ExtractError::NoExtractionDir(extract_dir.path().to_path_buf()));
        }
        if extract_dirs.len() > 1 {
            tracing::warn!(
                key,
                count = extract_dirs.len(),
                "found more than one image directory in OTA extraction"
            );
        }

        tracing::info!(key, "splitting & symsorting dyld_shared_cache");
        let results = dsc::find_dsc(&extract_dirs[0], &ota.version, &ota.build, work_dir)?;
        let split_dirs = dsc::split_dsc(&results, dsc::ipsw_splitter()).await?;
        self.symsort_and_upload(&split_dirs, key, ota, work_dir).await
    }

    /// Symsort every split directory under the artifact's bundle id and
    /// upload the resulting trees.
    async fn symsort_and_upload(
        &self,
        split_dirs: &[PathBuf],
        key: &str,
        ota: &OtaArtifact,
        work_dir: &Path,
    ) -> Result<SymbolUploadSummary, ExtractError> {
        let bundle_id = format!("ota_{key}");
        let mut total = SymbolUploadSummary::default();

        for split_dir in split_dirs {
            let symbols_dir = work_dir.join("symbols").join(&bundle_id);
            tools::symsorter::symsort(split_dir, &symbols_dir, &ota.platform, &bundle_id, false)
                .await?;
            let summary =
                symbols::upload_symbol_binaries(self.store.clone(), &symbols_dir).await?;
            total.uploaded += summary.uploaded;
            total.duplicates += summary.duplicates;
            total.bundle_collision |= summary.bundle_collision;
        }

        Ok(total)
    }
}

/// Immediate subdirectories of `dir`.
fn list_dirs(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use symx_schema::OtaMetaData;

    fn artifact(id: &str, state: ArtifactProcessingState) -> OtaArtifact {
        OtaArtifact {
            id: id.to_string(),
            build: "21A100".into(),
            version: "17.0".into(),
            platform: "ios".into(),
            url: format!("https://example.com/{id}.zip"),
            // sha1("")
            hash: "da39a3ee5e6b4b0d3255bfef95601890afd80709".into(),
            hash_algorithm: "SHA-1".into(),
            description: Vec::new(),
            devices: Vec::new(),
            download_path: Some(format!("mirror/ota/ios/17.0/21A100/{id}.zip")),
            processing_state: state,
            last_run: 0,
        }
    }

    async fn seed(store: &Arc<MemoryStore>, meta: &OtaMetaData) {
        let doc = serde_json::to_vec(meta).unwrap();
        store
            .put_bytes(symx_schema::OTA_META_JSON, doc.into(), 0)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn next_mirrored_skips_other_states() {
        let store = Arc::new(MemoryStore::new());
        let mut meta = OtaMetaData::new();
        meta.insert("a".into(), artifact("a", ArtifactProcessingState::Indexed));
        meta.insert(
            "b".into(),
            artifact("b", ArtifactProcessingState::SymbolsExtracted),
        );
        seed(&store, &meta).await;

        let extract = OtaExtract::new(store, 1);
        assert!(extract.next_mirrored().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn extract_leaves_non_mirrored_states_unchanged() {
        let store = Arc::new(MemoryStore::new());
        let mut meta = OtaMetaData::new();
        meta.insert("a".into(), artifact("a", ArtifactProcessingState::Indexed));
        meta.insert(
            "b".into(),
            artifact("b", ArtifactProcessingState::SymbolsExtracted),
        );
        seed(&store, &meta).await;

        let extract = OtaExtract::new(store.clone(), 1);
        extract.extract(&RunBudget::minutes(5)).await.unwrap();

        let (after, _) = OtaMetaStore::new(store).load().await.unwrap();
        assert_eq!(after["a"].processing_state, ArtifactProcessingState::Indexed);
        assert_eq!(
            after["b"].processing_state,
            ArtifactProcessingState::SymbolsExtracted
        );
    }

    #[tokio::test]
    async fn missing_mirror_blob_marks_source_corrupt() {
        let store = Arc::new(MemoryStore::new());
        let mut meta = OtaMetaData::new();
        meta.insert("m".into(), artifact("m", ArtifactProcessingState::Mirrored));
        seed(&store, &meta).await;
        // No blob at the recorded mirror path.

        let extract = OtaExtract::new(store.clone(), 9);
        extract.extract(&RunBudget::minutes(5)).await.unwrap();

        let (after, _) = OtaMetaStore::new(store).load().await.unwrap();
        assert_eq!(
            after["m"].processing_state,
            ArtifactProcessingState::MirrorCorrupt
        );
        assert_eq!(after["m"].last_run, 9);
    }

    #[tokio::test]
    async fn corrupted_mirror_blob_marks_source_corrupt() {
        let store = Arc::new(MemoryStore::new());
        let mut meta = OtaMetaData::new();
        let ota = artifact("m", ArtifactProcessingState::Mirrored);
        store
            .put_bytes(
                ota.download_path.as_deref().unwrap(),
                bytes::Bytes::from_static(b"not the recorded content"),
                0,
            )
            .await
            .unwrap();
        meta.insert("m".into(), ota);
        seed(&store, &meta).await;

        let extract = OtaExtract::new(store.clone(), 1);
        extract.extract(&RunBudget::minutes(5)).await.unwrap();

        let (after, _) = OtaMetaStore::new(store).load().await.unwrap();
        assert_eq!(
            after["m"].processing_state,
            ArtifactProcessingState::MirrorCorrupt
        );
    }

    #[test]
    fn list_dirs_ignores_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("file"), b"").unwrap();

        let dirs = list_dirs(tmp.path()).unwrap();
        assert_eq!(dirs, vec![tmp.path().join("sub")]);
    }
}
