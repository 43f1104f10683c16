//! IPSW extract stage.
//!
//! A mirrored restore image is pulled into scratch, its shared caches are
//! extracted (`ipsw extract -d`) and split, and the split output is
//! symsorted under the source's bundle id. macOS images carry caches for
//! both architectures, so extraction runs once per arch; all images
//! additionally get a whole-volume symsort pass over the mounted system
//! DMG to capture binaries that never enter the shared cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use symx_schema::filters::extract_filter;
use symx_schema::{Arch, ArtifactProcessingState, IpswArtifact, IpswPlatform, IpswSource};

use crate::budget::RunBudget;
use crate::dsc::ExtractError;
use crate::ipsw::{bundle_id, IpswError};
use crate::meta::IpswMetaStore;
use crate::net;
use crate::store::ObjectStore;
use crate::symbols::{self, SymbolUploadSummary};
use crate::tools;

/// Directory names the extractor creates itself and must not mistake for
/// an `ipsw extract` output directory.
const RESERVED_DIRS: [&str; 2] = ["split_out", "symbols"];

/// Extract stage for the IPSW domain.
pub struct IpswExtract {
    store: Arc<dyn ObjectStore>,
    meta: IpswMetaStore,
    run_id: u64,
}

impl std::fmt::Debug for IpswExtract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpswExtract")
            .field("store", &self.store.name())
            .finish()
    }
}

impl IpswExtract {
    /// An extract worker against `store`, stamping mutations with `run_id`.
    pub fn new(store: Arc<dyn ObjectStore>, run_id: u64) -> Self {
        IpswExtract {
            meta: IpswMetaStore::new(store.clone()),
            store,
            run_id,
        }
    }

    /// Next mirrored source, reloading the document first so concurrent
    /// workers' progress is observed and no stale candidate wastes
    /// subprocess work.
    async fn next_mirrored(&self) -> Result<Option<(IpswArtifact, usize)>, IpswError> {
        let (db, _) = self.meta.load().await?;
        let candidates = extract_filter(db.artifacts.values());
        Ok(candidates.first().and_then(|artifact| {
            artifact
                .sources
                .iter()
                .position(|source| source.processing_state.is_extractable())
                .map(|index| ((*artifact).clone(), index))
        }))
    }

    /// Run the extract loop until no candidates remain or the budget
    /// elapses.
    pub async fn extract(&self, budget: &RunBudget) -> Result<(), IpswError> {
        tracing::debug!(storage = self.store.name(), "extracting symbols from IPSW images");

        loop {
            if budget.expired() {
                tracing::warn!(elapsed = ?budget.elapsed(), "exiting IPSW extract due to elapsed timeout");
                return Ok(());
            }
            let Some((artifact, index)) = self.next_mirrored().await? else {
                tracing::info!("no more mirrored IPSW sources, exiting");
                return Ok(());
            };

            self.process_source(artifact, index).await?;
        }
    }

    /// Process one mirrored source; failures are recorded in its state
    /// so they never block the next candidate.
    async fn process_source(
        &self,
        mut artifact: IpswArtifact,
        index: usize,
    ) -> Result<(), IpswError> {
        let key = artifact.key();
        let file_name = artifact.sources[index].file_name();
        tracing::info!(%key, source = %file_name, "extracting IPSW source");

        let work_dir = tempfile::tempdir()?;
        let state = match self.load_mirrored(&artifact.sources[index], work_dir.path()).await? {
            None => {
                tracing::error!(%key, source = %file_name, "mirror blob missing or corrupt");
                ArtifactProcessingState::MirrorCorrupt
            }
            Some(local_ipsw) => {
                match self
                    .run_extraction(&artifact, index, &local_ipsw, work_dir.path())
                    .await
                {
                    Ok(summary) if summary.bundle_collision => {
                        ArtifactProcessingState::BundleDuplicationDetected
                    }
                    Ok(_) => ArtifactProcessingState::SymbolsExtracted,
                    Err(
                        ExtractError::NoDscFound(_)
                        | ExtractError::NoExtractionDir(_)
                        | ExtractError::NoDscRootFile(_),
                    ) => {
                        tracing::warn!(%key, source = %file_name, "no dyld_shared_cache in IPSW");
                        ArtifactProcessingState::DscExtractionFailed
                    }
                    Err(err) => {
                        tracing::warn!(%key, source = %file_name, error = %err, "failed to extract symbols from IPSW");
                        ArtifactProcessingState::SymbolExtractionFailed
                    }
                }
            }
        };

        artifact.sources[index].processing_state = state;
        artifact.sources[index].last_run = self.run_id;
        self.meta.update_item(&artifact).await?;
        Ok(())
    }

    /// Fetch the mirrored blob into scratch and re-verify it when a hash
    /// is recorded.
    async fn load_mirrored(
        &self,
        source: &IpswSource,
        work_dir: &Path,
    ) -> Result<Option<PathBuf>, IpswError> {
        let Some(mirror_path) = source.mirror_path.as_deref() else {
            return Ok(None);
        };
        let local_path = work_dir.join(source.file_name());
        if !self.store.download_to_path(mirror_path, &local_path).await? {
            return Ok(None);
        }
        if let Some(sha1) = source.sha1() {
            if !net::check_sha1(sha1, &local_path).await? {
                tracing::error!(mirror_path, "SHA-1 mismatch between mirror blob and meta-data");
                return Ok(None);
            }
        }
        Ok(Some(local_path))
    }

    /// Extract, split, symsort, and upload one restore image.
    async fn run_extraction(
        &self,
        artifact: &IpswArtifact,
        index: usize,
        local_ipsw: &Path,
        work_dir: &Path,
    ) -> Result<SymbolUploadSummary, ExtractError> {
        let source = &artifact.sources[index];
        let bundle_id = bundle_id(source);
        let prefix = artifact.platform.symbol_prefix();

        let split_dir = if artifact.platform == IpswPlatform::MacOs {
            // macOS IPSWs carry shared caches for both architectures;
            // each lands in its own split_out sub-dir so one symsort run
            // covers them all.
            let mut split_dir = None;
            for arch in [Arch::Arm64e, Arch::X86_64] {
                tools::ipsw::extract_dsc(local_ipsw, work_dir, Some(arch)).await?;
                let extract_dir = find_extraction_dir(work_dir)?
                    .ok_or_else(|| ExtractError::NoExtractionDir(work_dir.to_path_buf()))?;
                split_dir = Some(self.split_extraction(&extract_dir, work_dir, Some(arch)).await?);
            }
            split_dir.ok_or_else(|| ExtractError::NoExtractionDir(work_dir.to_path_buf()))?
        } else {
            tools::ipsw::extract_dsc(local_ipsw, work_dir, None).await?;
            let extract_dir = find_extraction_dir(work_dir)?
                .ok_or_else(|| ExtractError::NoExtractionDir(work_dir.to_path_buf()))?;
            self.split_extraction(&extract_dir, work_dir, None).await?
        };

        let symbols_dir = work_dir.join("symbols");
        tools::symsorter::symsort(&split_dir, &symbols_dir, &prefix, &bundle_id, false).await?;
        let mut summary = self.upload(&symbols_dir).await?;

        // Whole-volume pass: mount the system DMG and symsort everything
        // on it to capture binaries outside the shared cache. The mounter
        // blocks until it gets SIGINT.
        let volume_summary = self
            .symsort_system_volume(local_ipsw, work_dir, &prefix, &bundle_id)
            .await?;
        summary.uploaded += volume_summary.uploaded;
        summary.duplicates += volume_summary.duplicates;
        summary.bundle_collision |= volume_summary.bundle_collision;

        Ok(summary)
    }

    /// Split the DSC root file of one extraction directory into
    /// `split_out[/arch]`, then drop the extraction input.
    async fn split_extraction(
        &self,
        extract_dir: &Path,
        work_dir: &Path,
        arch: Option<Arch>,
    ) -> Result<PathBuf, ExtractError> {
        let dsc_root = find_dsc_root_file(extract_dir)?
            .ok_or_else(|| ExtractError::NoDscRootFile(extract_dir.to_path_buf()))?;

        let split_dir = work_dir.join("split_out");
        let split_target = match arch {
            Some(arch) => split_dir.join(arch.as_str()),
            None => split_dir.clone(),
        };

        let result = tools::ipsw::dyld_split(&dsc_root, &split_target).await;
        // Extraction inputs are several gigabytes; drop them as soon as
        // the split has consumed them.
        std::fs::remove_dir_all(extract_dir)?;
        result?;

        Ok(split_dir)
    }

    async fn symsort_system_volume(
        &self,
        local_ipsw: &Path,
        work_dir: &Path,
        prefix: &str,
        bundle_id: &str,
    ) -> Result<SymbolUploadSummary, ExtractError> {
        let mount = tools::ipsw::mount_system(local_ipsw).await?;
        let volume_symbols_dir = work_dir.join("volume_symbols");
        let symsort_result = tools::symsorter::symsort(
            &mount.mount_point,
            &volume_symbols_dir,
            prefix,
            bundle_id,
            true,
        )
        .await;
        // The volume must come down even when symsorting failed.
        mount.unmount().await?;
        symsort_result?;

        self.upload(&volume_symbols_dir).await
    }

    async fn upload(&self, symbols_dir: &Path) -> Result<SymbolUploadSummary, ExtractError> {
        Ok(symbols::upload_symbol_binaries(self.store.clone(), symbols_dir).await?)
    }
}

/// The `ipsw extract` output directory: any sub-directory that is not one
/// of ours.
fn find_extraction_dir(processing_dir: &Path) -> Result<Option<PathBuf>, ExtractError> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(processing_dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_dir()
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| !RESERVED_DIRS.contains(&name))
        })
        .collect();
    dirs.sort();
    Ok(dirs.into_iter().next())
}

/// The DSC root file within an extraction directory: the file without an
/// extension.
fn find_dsc_root_file(extract_dir: &Path) -> Result<Option<PathBuf>, ExtractError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(extract_dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_none())
        .collect();
    files.sort();
    Ok(files.into_iter().next())
}
