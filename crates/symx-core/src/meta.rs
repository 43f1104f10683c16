//! CAS-protected metadata document stores.
//!
//! Each domain owns one authoritative JSON document at a fixed key. Every
//! mutation is a load -> modify -> conditional-save cycle guarded by the
//! blob generation; a lost race reloads and re-applies. The retry budget
//! is deliberately small: under normal contention one retry suffices, and
//! a store that keeps losing the race has a real problem worth surfacing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use symx_schema::{
    merge_meta_data, IpswArtifact, IpswArtifactDb, MergeError, OtaArtifact, OtaMetaData,
    IMPORT_STATE_JSON, IPSW_META_JSON, OTA_META_JSON,
};

use crate::store::{ObjectStore, StoreError, GENERATION_NOT_PRESENT};

/// Attempts per CAS-protected write before giving up loudly.
const CAS_RETRY_BUDGET: u32 = 5;

/// Errors raised by metadata-document operations.
#[derive(Error, Debug)]
pub enum MetaError {
    /// The object store failed underneath us.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The merge protocol refused the incoming document. Never retried:
    /// this signals an upstream identity change that needs a human.
    #[error(transparent)]
    Merge(#[from] MergeError),

    /// The stored document no longer parses as its schema.
    #[error("metadata document '{key}' is corrupt: {source}")]
    Corrupt {
        /// Object key of the document.
        key: &'static str,
        /// The deserialization failure.
        #[source]
        source: serde_json::Error,
    },

    /// Every CAS attempt lost its race.
    #[error("failed to update '{key}' after {CAS_RETRY_BUDGET} precondition conflicts")]
    RetriesExhausted {
        /// Object key of the document.
        key: &'static str,
    },
}

async fn load_document<T>(
    store: &dyn ObjectStore,
    key: &'static str,
) -> Result<(T, u64), MetaError>
where
    T: Default + for<'de> Deserialize<'de>,
{
    match store.get(key).await? {
        Some((body, generation)) => {
            let document =
                serde_json::from_slice(&body).map_err(|source| MetaError::Corrupt { key, source })?;
            Ok((document, generation))
        }
        None => Ok((T::default(), GENERATION_NOT_PRESENT)),
    }
}

async fn save_document<T: Serialize>(
    store: &dyn ObjectStore,
    key: &'static str,
    document: &T,
    expected_generation: u64,
) -> Result<u64, MetaError> {
    let body = serde_json::to_vec(document)
        .map_err(|source| MetaError::Corrupt { key, source })?;
    Ok(store
        .put_bytes(key, body.into(), expected_generation)
        .await?)
}

/// The OTA metadata document (`ota_image_meta.json`).
#[derive(Clone)]
pub struct OtaMetaStore {
    store: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for OtaMetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtaMetaStore")
            .field("store", &self.store.name())
            .finish()
    }
}

impl OtaMetaStore {
    /// A handle over the OTA document in `store`.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        OtaMetaStore { store }
    }

    /// Read the document; `(empty, 0)` when it does not exist yet.
    pub async fn load(&self) -> Result<(OtaMetaData, u64), MetaError> {
        load_document(self.store.as_ref(), OTA_META_JSON).await
    }

    /// Conditional write against `expected_generation`.
    pub async fn save(
        &self,
        document: &OtaMetaData,
        expected_generation: u64,
    ) -> Result<u64, MetaError> {
        save_document(self.store.as_ref(), OTA_META_JSON, document, expected_generation).await
    }

    /// Merge an upstream snapshot into the stored document under CAS,
    /// reloading and re-merging on lost races. Returns the merged view.
    pub async fn merge_from_upstream(
        &self,
        incoming: &OtaMetaData,
    ) -> Result<OtaMetaData, MetaError> {
        for _ in 0..CAS_RETRY_BUDGET {
            let (mut ours, generation) = self.load().await?;
            merge_meta_data(&mut ours, incoming)?;
            match self.save(&ours, generation).await {
                Ok(_) => return Ok(ours),
                Err(MetaError::Store(err)) if err.is_precondition_failed() => {
                    tracing::debug!("lost metadata merge race, reloading");
                }
                Err(other) => return Err(other),
            }
        }
        tracing::warn!("giving up on OTA metadata merge after repeated conflicts");
        Err(MetaError::RetriesExhausted { key: OTA_META_JSON })
    }

    /// Read-modify-write a single entry under CAS.
    pub async fn update_item(
        &self,
        key: &str,
        artifact: &OtaArtifact,
    ) -> Result<(), MetaError> {
        for _ in 0..CAS_RETRY_BUDGET {
            let (mut ours, generation) = self.load().await?;
            ours.insert(key.to_string(), artifact.clone());
            match self.save(&ours, generation).await {
                Ok(_) => return Ok(()),
                Err(MetaError::Store(err)) if err.is_precondition_failed() => {
                    tracing::debug!(key, "lost metadata item race, reloading");
                }
                Err(other) => return Err(other),
            }
        }
        Err(MetaError::RetriesExhausted { key: OTA_META_JSON })
    }
}

/// The IPSW metadata document (`ipsw_meta.json`).
#[derive(Clone)]
pub struct IpswMetaStore {
    store: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for IpswMetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpswMetaStore")
            .field("store", &self.store.name())
            .finish()
    }
}

impl IpswMetaStore {
    /// A handle over the IPSW document in `store`.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        IpswMetaStore { store }
    }

    /// Read the document; `(default, 0)` when it does not exist yet.
    pub async fn load(&self) -> Result<(IpswArtifactDb, u64), MetaError> {
        load_document(self.store.as_ref(), IPSW_META_JSON).await
    }

    /// Conditional write against `expected_generation`.
    pub async fn save(
        &self,
        document: &IpswArtifactDb,
        expected_generation: u64,
    ) -> Result<u64, MetaError> {
        save_document(self.store.as_ref(), IPSW_META_JSON, document, expected_generation).await
    }

    /// Read-modify-write a single artifact under CAS, keyed by
    /// [`IpswArtifact::key`].
    ///
    /// The mirror and extract workflows run concurrently against this
    /// document; per-item writes keep their conflict window to one entry
    /// instead of livelocking on full-document overwrites.
    pub async fn update_item(&self, artifact: &IpswArtifact) -> Result<(), MetaError> {
        let key = artifact.key();
        for _ in 0..CAS_RETRY_BUDGET {
            let (mut ours, generation) = self.load().await?;
            ours.upsert(key.clone(), artifact.clone());
            match self.save(&ours, generation).await {
                Ok(_) => return Ok(()),
                Err(MetaError::Store(err)) if err.is_precondition_failed() => {
                    tracing::debug!(%key, "lost metadata item race, reloading");
                }
                Err(other) => return Err(other),
            }
        }
        Err(MetaError::RetriesExhausted {
            key: IPSW_META_JSON,
        })
    }
}

/// The AppleDB import-state document (`appledb_import_state.json`).
///
/// Records, per `platform/folder`, the content hashes of files already
/// imported so that re-running against an unchanged repository snapshot is
/// a near no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportState {
    /// Content hashes of imported files, per `platform/folder`.
    #[serde(default)]
    pub folder_hashes: BTreeMap<String, BTreeSet<String>>,
}

impl ImportState {
    /// Whether a file with this content hash was already imported.
    pub fn contains(&self, folder: &str, file_hash: &str) -> bool {
        self.folder_hashes
            .get(folder)
            .is_some_and(|hashes| hashes.contains(file_hash))
    }

    /// Record a processed file.
    pub fn record(&mut self, folder: &str, file_hash: String) {
        self.folder_hashes
            .entry(folder.to_string())
            .or_default()
            .insert(file_hash);
    }
}

/// Load the import-state document; `(default, 0)` when absent.
pub async fn load_import_state(
    store: &dyn ObjectStore,
) -> Result<(ImportState, u64), MetaError> {
    load_document(store, IMPORT_STATE_JSON).await
}

/// Write the import-state document against its generation.
pub async fn save_import_state(
    store: &dyn ObjectStore,
    state: &ImportState,
    expected_generation: u64,
) -> Result<u64, MetaError> {
    save_document(store, IMPORT_STATE_JSON, state, expected_generation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use symx_schema::ArtifactProcessingState;

    fn artifact(id: &str) -> OtaArtifact {
        OtaArtifact {
            id: id.to_string(),
            build: "21A100".into(),
            version: "17.0".into(),
            platform: "ios".into(),
            url: format!("https://example.com/{id}.zip"),
            hash: format!("hash-{id}"),
            hash_algorithm: "SHA-1".into(),
            description: Vec::new(),
            devices: Vec::new(),
            download_path: None,
            processing_state: ArtifactProcessingState::Indexed,
            last_run: 0,
        }
    }

    #[tokio::test]
    async fn load_of_absent_document_is_empty_at_generation_zero() {
        let meta = OtaMetaStore::new(Arc::new(MemoryStore::new()));
        let (document, generation) = meta.load().await.unwrap();
        assert!(document.is_empty());
        assert_eq!(generation, 0);
    }

    #[tokio::test]
    async fn merge_then_reload_round_trips() {
        let meta = OtaMetaStore::new(Arc::new(MemoryStore::new()));
        let mut incoming = OtaMetaData::new();
        incoming.insert("A".into(), artifact("A"));

        meta.merge_from_upstream(&incoming).await.unwrap();

        let (document, generation) = meta.load().await.unwrap();
        assert_eq!(document.len(), 1);
        assert!(generation > 0);
    }

    #[tokio::test]
    async fn save_against_stale_generation_fails() {
        let meta = OtaMetaStore::new(Arc::new(MemoryStore::new()));
        let mut document = OtaMetaData::new();
        document.insert("A".into(), artifact("A"));
        let generation = meta.save(&document, 0).await.unwrap();

        // A second writer bumped the document in the meantime.
        meta.save(&document, generation).await.unwrap();

        let err = meta.save(&document, generation).await.unwrap_err();
        assert!(matches!(err, MetaError::Store(inner) if inner.is_precondition_failed()));
    }

    #[tokio::test]
    async fn update_item_survives_interleaved_writes() {
        let store = Arc::new(MemoryStore::new());
        let meta = OtaMetaStore::new(store.clone());
        meta.update_item("A", &artifact("A")).await.unwrap();
        meta.update_item("B", &artifact("B")).await.unwrap();

        let (document, _) = meta.load().await.unwrap();
        assert_eq!(document.len(), 2);
    }

    #[tokio::test]
    async fn corrupt_document_is_not_silently_replaced() {
        let store = Arc::new(MemoryStore::new());
        store
            .put_bytes(OTA_META_JSON, bytes::Bytes::from_static(b"not json"), 0)
            .await
            .unwrap();

        let meta = OtaMetaStore::new(store);
        let err = meta.load().await.unwrap_err();
        assert!(matches!(err, MetaError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn import_state_round_trips() {
        let store = MemoryStore::new();
        let (mut state, generation) = load_import_state(&store).await.unwrap();
        assert_eq!(generation, 0);

        state.record("iOS/17.x - 21x", "abc123".into());
        save_import_state(&store, &state, generation).await.unwrap();

        let (reloaded, generation) = load_import_state(&store).await.unwrap();
        assert!(generation > 0);
        assert!(reloaded.contains("iOS/17.x - 21x", "abc123"));
        assert!(!reloaded.contains("iOS/17.x - 21x", "other"));
    }
}
