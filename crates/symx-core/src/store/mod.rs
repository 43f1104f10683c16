//! Object-store abstraction.
//!
//! The pipeline treats its backing store as a key/value blob store with
//! two properties the concurrency model depends on: a per-blob
//! monotonically-increasing generation counter usable as a write
//! precondition, and a per-blob content MD5 readable without downloading
//! the body. The adapter never retries precondition conflicts -- retrying
//! means re-running the caller's merge step, so it belongs to the caller.

/// Production implementation against the GCS JSON API.
pub mod gcs;
/// In-memory implementation for tests and local runs.
pub mod memory;

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use gcs::{GcsStore, StorageUri};
pub use memory::MemoryStore;

/// Generation value signalling "the object must not exist yet".
pub const GENERATION_NOT_PRESENT: u64 = 0;

/// Blob metadata returned by [`ObjectStore::head`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    /// The store's monotonic per-blob version counter.
    pub generation: u64,
    /// Hex-encoded MD5 of the blob content, when the store reports one.
    pub md5: Option<String>,
    /// Content length in bytes.
    pub size: u64,
}

/// Errors surfaced by object-store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A conditional write lost the race: the blob's generation did not
    /// match the precondition.
    #[error("precondition failed for '{key}' (expected generation {expected})")]
    PreconditionFailed {
        /// Object key the write targeted.
        key: String,
        /// Generation the caller required.
        expected: u64,
    },

    /// An operation required a blob that does not exist.
    #[error("object '{0}' not found")]
    NotFound(String),

    /// The HTTP request to the store failed.
    #[error("storage request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Local filesystem trouble while staging a blob.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend answered with something we cannot act on.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Minimal blob-store interface the pipeline needs.
///
/// `if_generation_match` semantics follow the backing store: `0` means
/// "create only, fail if the object exists"; any other value means "write
/// only if the current generation equals this value"; `None` on
/// [`ObjectStore::put_file`] writes unconditionally.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Blob metadata without the body; `None` when absent.
    async fn head(&self, key: &str) -> Result<Option<BlobInfo>, StoreError>;

    /// Full body plus its generation; `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<(Bytes, u64)>, StoreError>;

    /// Stream a blob to a local file. Returns `false` when the blob does
    /// not exist (the file is not created).
    async fn download_to_path(&self, key: &str, dest: &Path) -> Result<bool, StoreError>;

    /// Conditional write of an in-memory body. Returns the new generation.
    async fn put_bytes(
        &self,
        key: &str,
        body: Bytes,
        if_generation_match: u64,
    ) -> Result<u64, StoreError>;

    /// Upload a local file, optionally guarded by a generation
    /// precondition. Returns the new generation.
    async fn put_file(
        &self,
        key: &str,
        src: &Path,
        if_generation_match: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Keys under a prefix. Not used on the hot path.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Human-readable backend name for logs.
    fn name(&self) -> &str;
}

impl StoreError {
    /// Whether this error is a lost CAS race (as opposed to a real
    /// failure).
    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, StoreError::PreconditionFailed { .. })
    }
}
