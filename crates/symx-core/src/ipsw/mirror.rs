//! IPSW mirror stage.
//!
//! Candidates come from the release-date-windowed mirror filter, newest
//! first; within a candidate every still-indexed source is downloaded,
//! verified, and uploaded create-only to the mirror namespace. Metadata
//! is updated per source so concurrent workers see progress immediately.

use std::path::Path;
use std::sync::Arc;

use symx_schema::filters::mirror_filter;
use symx_schema::{ArtifactProcessingState, IpswArtifact};

use crate::budget::RunBudget;
use crate::ipsw::{mirror_key, IpswError};
use crate::meta::IpswMetaStore;
use crate::mirror::{upload_mirror_blob, MirrorUploadOutcome};
use crate::net;
use crate::store::ObjectStore;

/// Mirror stage for the IPSW domain.
pub struct IpswMirror {
    store: Arc<dyn ObjectStore>,
    meta: IpswMetaStore,
    run_id: u64,
}

impl std::fmt::Debug for IpswMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpswMirror")
            .field("store", &self.store.name())
            .finish()
    }
}

/// How a downloaded source checked out against its metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verification {
    HashVerified,
    SizeVerified,
    Unverified,
    Failed,
}

impl IpswMirror {
    /// A mirror worker against `store`, stamping mutations with `run_id`.
    pub fn new(store: Arc<dyn ObjectStore>, run_id: u64) -> Self {
        IpswMirror {
            meta: IpswMetaStore::new(store.clone()),
            store,
            run_id,
        }
    }

    /// Run the mirror loop until no candidates remain or the budget
    /// elapses. The document is reloaded per candidate so concurrent
    /// workers' progress is observed.
    pub async fn mirror(&self, budget: &RunBudget) -> Result<(), IpswError> {
        tracing::debug!(storage = self.store.name(), "mirroring IPSW images");
        let today = chrono::Utc::now().date_naive();

        loop {
            if budget.expired() {
                tracing::info!(elapsed = ?budget.elapsed(), "exiting IPSW mirror due to elapsed timeout");
                return Ok(());
            }

            let (db, _) = self.meta.load().await?;
            let candidate = mirror_filter(db.artifacts.values(), today)
                .first()
                .map(|artifact| (*artifact).clone());
            let Some(artifact) = candidate else {
                tracing::info!("no more mirror candidates, exiting");
                return Ok(());
            };

            self.mirror_artifact(artifact, budget).await?;
        }
    }

    /// Mirror every still-indexed source of one artifact.
    async fn mirror_artifact(
        &self,
        mut artifact: IpswArtifact,
        budget: &RunBudget,
    ) -> Result<(), IpswError> {
        tracing::info!(key = %artifact.key(), "mirroring IPSW artifact");
        let download_dir = tempfile::tempdir()?;

        for index in 0..artifact.sources.len() {
            if budget.expired() {
                return Ok(());
            }
            if !artifact.sources[index].processing_state.is_mirrorable() {
                tracing::debug!(
                    source = %artifact.sources[index].file_name(),
                    "bypassing source, already mirrored"
                );
                continue;
            }

            match self
                .mirror_source(&artifact, index, download_dir.path())
                .await
            {
                Ok((state, mirror_path)) => {
                    artifact.sources[index].processing_state = state;
                    artifact.sources[index].mirror_path = mirror_path;
                }
                Err(err) => {
                    tracing::error!(
                        source = %artifact.sources[index].file_name(),
                        error = %err,
                        "failed to mirror IPSW source"
                    );
                    artifact.sources[index].processing_state =
                        ArtifactProcessingState::MirroringFailed;
                }
            }
            artifact.sources[index].last_run = self.run_id;
            self.meta.update_item(&artifact).await?;
        }
        Ok(())
    }

    /// Download, verify, and upload a single source. Returns the state
    /// to record and the mirror path (when mirrored).
    async fn mirror_source(
        &self,
        artifact: &IpswArtifact,
        index: usize,
        download_dir: &Path,
    ) -> Result<(ArtifactProcessingState, Option<String>), IpswError> {
        let source = &artifact.sources[index];
        let local_path = download_dir.join(source.file_name());
        net::download_url_to_file(source.link.as_str(), &local_path).await?;

        if verify_download(&local_path, source).await? == Verification::Failed {
            tokio::fs::remove_file(&local_path).await?;
            return Ok((ArtifactProcessingState::MirroringFailed, None));
        }

        let destination = mirror_key(artifact, source);
        let outcome = upload_mirror_blob(self.store.as_ref(), &destination, &local_path).await?;
        tokio::fs::remove_file(&local_path).await?;

        match outcome {
            MirrorUploadOutcome::Stored | MirrorUploadOutcome::AlreadyPresent => {
                Ok((ArtifactProcessingState::Mirrored, Some(destination)))
            }
            MirrorUploadOutcome::ContentMismatch => {
                tracing::error!(
                    key = %destination,
                    "IPSW already exists in mirror with a different MD5"
                );
                Ok((ArtifactProcessingState::MirroringFailed, None))
            }
        }
    }
}

/// Verify a download against whatever the metadata knows: hash first,
/// size as a fallback, accepted as-is when neither is recorded.
async fn verify_download(
    path: &Path,
    source: &symx_schema::IpswSource,
) -> Result<Verification, IpswError> {
    if let Some(sha1) = source.sha1() {
        if net::check_sha1(sha1, path).await? {
            tracing::info!(file = %source.file_name(), "download completed and SHA-1 verified");
            return Ok(Verification::HashVerified);
        }
        tracing::error!(file = %source.file_name(), "could not verify downloaded IPSW against its meta-data hash");
        return Ok(Verification::Failed);
    }

    if let Some(expected_size) = source.size {
        let actual_size = tokio::fs::metadata(path).await?.len();
        if actual_size == expected_size {
            tracing::info!(
                file = %source.file_name(),
                "download completed but only size verified (no hash in meta-data)"
            );
            return Ok(Verification::SizeVerified);
        }
        tracing::error!(
            file = %source.file_name(),
            actual_size,
            expected_size,
            "downloaded IPSW size differs from its meta-data"
        );
        return Ok(Verification::Failed);
    }

    tracing::info!(
        file = %source.file_name(),
        "download completed but not verified (no hash nor size in meta-data)"
    );
    Ok(Verification::Unverified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use symx_schema::{IpswArtifactHashes, IpswSource};
    use url::Url;

    fn source(hashes: Option<IpswArtifactHashes>, size: Option<u64>) -> IpswSource {
        IpswSource {
            devices: Vec::new(),
            link: Url::parse("https://example.com/test.ipsw").unwrap(),
            hashes,
            size,
            processing_state: ArtifactProcessingState::Indexed,
            mirror_path: None,
            last_run: 0,
        }
    }

    fn temp_file(body: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.ipsw");
        std::fs::write(&path, body).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn hash_verification_wins_over_size() {
        let (_dir, path) = temp_file(b"hello");
        // sha1("hello"); deliberately wrong size to prove hash is used.
        let source = source(
            Some(IpswArtifactHashes {
                sha1: Some("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d".into()),
                sha2: None,
            }),
            Some(999),
        );
        assert_eq!(
            verify_download(&path, &source).await.unwrap(),
            Verification::HashVerified
        );
    }

    #[tokio::test]
    async fn bad_hash_fails_verification() {
        let (_dir, path) = temp_file(b"hello");
        let source = source(
            Some(IpswArtifactHashes {
                sha1: Some("0000000000000000000000000000000000000000".into()),
                sha2: None,
            }),
            None,
        );
        assert_eq!(
            verify_download(&path, &source).await.unwrap(),
            Verification::Failed
        );
    }

    #[tokio::test]
    async fn size_is_the_fallback_check() {
        let (_dir, path) = temp_file(b"hello");
        assert_eq!(
            verify_download(&path, &source(None, Some(5))).await.unwrap(),
            Verification::SizeVerified
        );
        assert_eq!(
            verify_download(&path, &source(None, Some(6))).await.unwrap(),
            Verification::Failed
        );
    }

    #[tokio::test]
    async fn no_hash_nor_size_is_accepted_unverified() {
        let (_dir, path) = temp_file(b"hello");
        assert_eq!(
            verify_download(&path, &source(None, None)).await.unwrap(),
            Verification::Unverified
        );
    }
}
