//! Symbol upload protocol.
//!
//! After symsorter has produced a debug-id-addressed tree, every file is
//! uploaded create-only to `symbols/` + its path relative to the symsort
//! root. Two workers extracting overlapping releases race benignly:
//! symsorter keys files by debug id, so two files at the same key are
//! byte-equal by construction and the first writer wins -- later writers
//! observe a precondition failure and count it as a duplicate. The only
//! collision worth flagging is the per-bundle index blob, which should be
//! unique per extraction.

use std::path::Path;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};

use crate::store::{ObjectStore, StoreError};

/// Bounded upload parallelism.
pub const MAX_CONCURRENT_UPLOADS: usize = 10;

/// Outcome tally of one symbol-tree upload.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SymbolUploadSummary {
    /// Files newly written.
    pub uploaded: usize,
    /// Files another worker had already written (idempotent no-ops).
    pub duplicates: usize,
    /// Whether the per-bundle index blob already existed.
    pub bundle_collision: bool,
}

enum UploadOutcome {
    Uploaded,
    Duplicate,
    BundleCollision,
}

/// Upload every file under `input_dir` into the symbol namespace.
///
/// `input_dir` is the symsort output root, i.e. the directory whose
/// children are `{platform}/{2-char-prefix}/...` and
/// `{platform}/bundles/{bundle_id}`. Relative paths are preserved
/// verbatim below `symbols/`.
pub async fn upload_symbol_binaries(
    store: Arc<dyn ObjectStore>,
    input_dir: &Path,
) -> Result<SymbolUploadSummary, StoreError> {
    let mut uploads = Vec::new();
    for entry in walkdir::WalkDir::new(input_dir) {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(input_dir)
            .map_err(|e| StoreError::Backend(format!("path outside symsort root: {e}")))?;
        let key = format!("symbols/{}", relative.to_string_lossy());
        let is_bundle_index = relative
            .parent()
            .and_then(Path::file_name)
            .is_some_and(|name| name == "bundles");
        uploads.push((entry.path().to_path_buf(), key, is_bundle_index));
    }

    let outcomes: Vec<UploadOutcome> = futures::stream::iter(uploads.into_iter().map(
        |(path, key, is_bundle_index)| {
            let store = store.clone();
            async move {
                match store.put_file(&key, &path, Some(0)).await {
                    Ok(_) => Ok(UploadOutcome::Uploaded),
                    Err(err) if err.is_precondition_failed() => {
                        if is_bundle_index {
                            tracing::warn!(%key, "bundle index already exists (bundle-id collision)");
                            Ok(UploadOutcome::BundleCollision)
                        } else {
                            tracing::debug!(%key, "symbol blob already uploaded by another worker");
                            Ok(UploadOutcome::Duplicate)
                        }
                    }
                    Err(err) => Err(err),
                }
            }
        },
    ))
    .buffer_unordered(MAX_CONCURRENT_UPLOADS)
    .try_collect()
    .await?;

    let mut summary = SymbolUploadSummary::default();
    for outcome in outcomes {
        match outcome {
            UploadOutcome::Uploaded => summary.uploaded += 1,
            UploadOutcome::Duplicate => summary.duplicates += 1,
            UploadOutcome::BundleCollision => summary.bundle_collision = true,
        }
    }

    tracing::info!(
        uploaded = summary.uploaded,
        duplicates = summary.duplicates,
        bundle_collision = summary.bundle_collision,
        "symbol upload finished"
    );
    Ok(summary)
}
