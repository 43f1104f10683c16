//! In-memory object store.
//!
//! Implements the same generation and MD5 semantics as the production
//! backend: generations start at 1 and increase by one per write, and a
//! precondition of `0` means create-only. Used by the test suites and
//! useful for dry-running stages against a scratch state.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use md5::{Digest, Md5};

use super::{BlobInfo, ObjectStore, StoreError};

#[derive(Debug, Clone)]
struct MemoryBlob {
    body: Bytes,
    generation: u64,
}

/// A process-local [`ObjectStore`] backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: Mutex<BTreeMap<String, MemoryBlob>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, MemoryBlob>>, StoreError> {
        self.blobs
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    /// Number of stored blobs (test helper).
    pub fn len(&self) -> usize {
        self.blobs.lock().map(|blobs| blobs.len()).unwrap_or(0)
    }

    /// Whether the store holds no blobs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_precondition(
        key: &str,
        current: Option<u64>,
        expected: u64,
    ) -> Result<(), StoreError> {
        let matches = match expected {
            0 => current.is_none(),
            n => current == Some(n),
        };
        if matches {
            Ok(())
        } else {
            Err(StoreError::PreconditionFailed {
                key: key.to_string(),
                expected,
            })
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn head(&self, key: &str) -> Result<Option<BlobInfo>, StoreError> {
        let blobs = self.lock()?;
        Ok(blobs.get(key).map(|blob| BlobInfo {
            generation: blob.generation,
            md5: Some(hex::encode(Md5::digest(&blob.body))),
            size: blob.body.len() as u64,
        }))
    }

    async fn get(&self, key: &str) -> Result<Option<(Bytes, u64)>, StoreError> {
        let blobs = self.lock()?;
        Ok(blobs
            .get(key)
            .map(|blob| (blob.body.clone(), blob.generation)))
    }

    async fn download_to_path(&self, key: &str, dest: &Path) -> Result<bool, StoreError> {
        let body = {
            let blobs = self.lock()?;
            blobs.get(key).map(|blob| blob.body.clone())
        };
        match body {
            Some(body) => {
                tokio::fs::write(dest, &body).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn put_bytes(
        &self,
        key: &str,
        body: Bytes,
        if_generation_match: u64,
    ) -> Result<u64, StoreError> {
        let mut blobs = self.lock()?;
        let current = blobs.get(key).map(|blob| blob.generation);
        Self::check_precondition(key, current, if_generation_match)?;
        let generation = current.unwrap_or(0) + 1;
        blobs.insert(key.to_string(), MemoryBlob { body, generation });
        Ok(generation)
    }

    async fn put_file(
        &self,
        key: &str,
        src: &Path,
        if_generation_match: Option<u64>,
    ) -> Result<u64, StoreError> {
        let body = Bytes::from(tokio::fs::read(src).await?);
        let mut blobs = self.lock()?;
        let current = blobs.get(key).map(|blob| blob.generation);
        if let Some(expected) = if_generation_match {
            Self::check_precondition(key, current, expected)?;
        }
        let generation = current.unwrap_or(0) + 1;
        blobs.insert(key.to_string(), MemoryBlob { body, generation });
        Ok(generation)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let blobs = self.lock()?;
        Ok(blobs
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
