//! Shared mirror-upload semantics for both artifact domains.
//!
//! Mirror blobs are write-once-per-key. When a key already exists the
//! store's native MD5 decides whether an earlier worker simply beat us
//! (byte-identical content, only metadata lagging) or the mirror is
//! actually inconsistent.

use std::path::Path;

use crate::net;
use crate::store::{ObjectStore, StoreError};

/// Result of a create-only mirror upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorUploadOutcome {
    /// We wrote the blob.
    Stored,
    /// An earlier worker wrote byte-identical content; only metadata was
    /// behind.
    AlreadyPresent,
    /// A blob exists at the key with different content.
    ContentMismatch,
}

/// Create-only upload of a mirror blob with MD5 reconciliation.
pub async fn upload_mirror_blob(
    store: &dyn ObjectStore,
    key: &str,
    local_path: &Path,
) -> Result<MirrorUploadOutcome, StoreError> {
    match store.head(key).await? {
        None => {
            tracing::info!(key, "uploading mirror blob");
            store.put_file(key, local_path, Some(0)).await?;
            Ok(MirrorUploadOutcome::Stored)
        }
        Some(info) => {
            let local_md5 = net::file_md5_hex(local_path).await?;
            if info.md5.as_deref() == Some(local_md5.as_str()) {
                Ok(MirrorUploadOutcome::AlreadyPresent)
            } else {
                Ok(MirrorUploadOutcome::ContentMismatch)
            }
        }
    }
}
