//! OTA artifact schema and the metadata merge protocol.
//!
//! The merge protocol is the core of the whole pipeline: it decides what
//! counts as artifact identity, when two records are payload-duplicates of
//! each other, and refuses to continue when upstream identity silently
//! changes under us.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::ArtifactProcessingState;

/// A single downloadable OTA update package, keyed by the SHA-1-shaped
/// stem of its zip URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaArtifact {
    /// Opaque identifier derived from the URL path stem.
    pub id: String,
    /// Apple build number (e.g. `21A100`).
    pub build: String,
    /// Marketing version (e.g. `17.0`).
    pub version: String,
    /// Lowercase platform name (`ios`, `watchos`, ...).
    pub platform: String,
    /// Source URL at the Apple CDN.
    pub url: String,
    /// Content hash as reported by Apple.
    pub hash: String,
    /// Hash algorithm name; currently always `SHA-1`.
    pub hash_algorithm: String,
    /// Human-readable labels, merged as a set.
    #[serde(default)]
    pub description: Vec<String>,
    /// Device model strings, merged as a set.
    #[serde(default)]
    pub devices: Vec<String>,
    /// Mirror key of the uploaded blob, if mirrored.
    #[serde(default)]
    pub download_path: Option<String>,
    /// Where this artifact stands in the pipeline.
    #[serde(default)]
    pub processing_state: ArtifactProcessingState,
    /// Workflow-run id of the most recent mutation.
    #[serde(default)]
    pub last_run: u64,
}

impl OtaArtifact {
    /// Whether all identity-contributing fields of `other` match ours.
    fn same_identity(&self, other: &OtaArtifact) -> bool {
        self.build == other.build && self.payload_identity(other)
    }

    /// Identity minus the build: equal payloads shipped under different
    /// builds are the beta-duplicate case.
    fn payload_identity(&self, other: &OtaArtifact) -> bool {
        self.version == other.version
            && self.platform == other.platform
            && self.url == other.url
            && self.hash == other.hash
            && self.hash_algorithm == other.hash_algorithm
    }

    /// Payload equality used for the duplicate scan on newly-inserted
    /// keys: same content hash, platform, and version under another build.
    fn payload_equal(&self, other: &OtaArtifact) -> bool {
        self.hash == other.hash
            && self.hash_algorithm == other.hash_algorithm
            && self.platform == other.platform
            && self.version == other.version
            && self.build != other.build
    }
}

/// The authoritative per-domain metadata document: a map from artifact key
/// to artifact record. A `BTreeMap` keeps serialization stable.
pub type OtaMetaData = BTreeMap<String, OtaArtifact>;

/// Fatal conditions raised by the merge protocol.
#[derive(Error, Debug)]
pub enum MergeError {
    /// An incoming record carries the key of an existing record but
    /// differs in an identity-contributing field other than the build.
    /// This means our notion of identity no longer matches upstream and
    /// must never be papered over.
    #[error(
        "matching key '{key}' with differing identity:\n\tlocal: {ours:?}\n\tincoming: {theirs:?}"
    )]
    IdentityMismatch {
        /// The colliding map key.
        key: String,
        /// Our stored record.
        ours: Box<OtaArtifact>,
        /// The incoming upstream record.
        theirs: Box<OtaArtifact>,
    },
}

/// Union two string sets, preserving sorted order and dropping duplicates.
fn merge_string_sets(ours: &[String], theirs: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = ours.iter().chain(theirs.iter()).cloned().collect();
    merged.sort();
    merged.dedup();
    merged
}

/// Next free `{key}_duplicate_N` key in `ours`.
pub fn generate_duplicate_key_from(ours: &OtaMetaData, their_key: &str) -> String {
    let mut duplicate_num = 1;
    loop {
        let candidate = format!("{their_key}_duplicate_{duplicate_num}");
        if !ours.contains_key(&candidate) {
            return candidate;
        }
        duplicate_num += 1;
    }
}

/// Merge the upstream view of the world (`theirs`) into our store
/// (`ours`).
///
/// - Existing keys: `devices` and `description` grow as sets; identity
///   fields must match. If only the build differs the incoming record is
///   inserted under a fresh `_duplicate_N` key and marked
///   [`ArtifactProcessingState::IndexedDuplicate`]. Any other identity
///   difference is a fatal [`MergeError::IdentityMismatch`].
/// - New keys: inserted verbatim, then scanned against existing entries
///   for payload equality (same hash/platform/version, different build);
///   a match marks the new entry `IndexedDuplicate`.
/// - `processing_state`, `download_path`, and `last_run` of existing
///   entries are never touched.
///
/// The operation is idempotent: re-merging an already-merged document is
/// a no-op.
pub fn merge_meta_data(ours: &mut OtaMetaData, theirs: &OtaMetaData) -> Result<(), MergeError> {
    for (their_key, their_item) in theirs {
        if let Some(our_item) = ours.get(their_key).cloned() {
            if our_item.same_identity(their_item) {
                if let Some(entry) = ours.get_mut(their_key) {
                    entry.description =
                        merge_string_sets(&our_item.description, &their_item.description);
                    entry.devices = merge_string_sets(&our_item.devices, &their_item.devices);
                }
                continue;
            }

            if our_item.payload_identity(their_item) {
                // Same payload under a different build: a beta that later
                // shipped as GA unchanged. Record it under its own key so
                // the key prefix is kept, but never process it twice.
                if ours.values().any(|v| v.same_identity(their_item)) {
                    // Already recorded on a previous merge.
                    continue;
                }
                let duplicate_key = generate_duplicate_key_from(ours, their_key);
                let mut duplicate = their_item.clone();
                duplicate.processing_state = ArtifactProcessingState::IndexedDuplicate;
                ours.insert(duplicate_key, duplicate);
                continue;
            }

            return Err(MergeError::IdentityMismatch {
                key: their_key.clone(),
                ours: Box::new(our_item.clone()),
                theirs: Box::new(their_item.clone()),
            });
        }

        // New key: insert, then look for a payload-equal sibling so beta
        // and GA releases of the same bytes are only processed once.
        let is_duplicate = ours.values().any(|v| v.payload_equal(their_item));
        let mut new_item = their_item.clone();
        if is_duplicate {
            new_item.processing_state = ArtifactProcessingState::IndexedDuplicate;
        }
        ours.insert(their_key.clone(), new_item);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(id: &str, build: &str, version: &str, hash: &str, url: &str) -> OtaArtifact {
        OtaArtifact {
            id: id.to_string(),
            build: build.to_string(),
            version: version.to_string(),
            platform: "ios".to_string(),
            url: url.to_string(),
            hash: hash.to_string(),
            hash_algorithm: "SHA-1".to_string(),
            description: Vec::new(),
            devices: Vec::new(),
            download_path: None,
            processing_state: ArtifactProcessingState::Indexed,
            last_run: 0,
        }
    }

    #[test]
    fn merge_into_empty_inserts_verbatim() {
        let mut ours = OtaMetaData::new();
        let mut theirs = OtaMetaData::new();
        theirs.insert("A".into(), artifact("A", "21A100", "17.0", "H", "U"));

        merge_meta_data(&mut ours, &theirs).unwrap();

        assert_eq!(ours.len(), 1);
        assert_eq!(
            ours["A"].processing_state,
            ArtifactProcessingState::Indexed
        );
    }

    #[test]
    fn merge_marks_beta_of_release_as_duplicate() {
        // Beta ships the same payload under a different build.
        let mut ours = OtaMetaData::new();
        ours.insert("A".into(), artifact("A", "21A100", "17.0", "H", "U"));

        let mut theirs = OtaMetaData::new();
        theirs.insert("A_beta".into(), artifact("A", "21A99", "17.0", "H", "U"));

        merge_meta_data(&mut ours, &theirs).unwrap();

        assert_eq!(
            ours["A"].processing_state,
            ArtifactProcessingState::Indexed
        );
        assert_eq!(
            ours["A_beta"].processing_state,
            ArtifactProcessingState::IndexedDuplicate
        );
    }

    #[test]
    fn merge_same_key_differing_build_gets_duplicate_key() {
        let mut ours = OtaMetaData::new();
        ours.insert("A".into(), artifact("A", "21A100", "17.0", "H", "U"));

        let mut theirs = OtaMetaData::new();
        theirs.insert("A".into(), artifact("A", "21A101", "17.0", "H", "U"));

        merge_meta_data(&mut ours, &theirs).unwrap();

        assert_eq!(ours.len(), 2);
        assert_eq!(
            ours["A_duplicate_1"].processing_state,
            ArtifactProcessingState::IndexedDuplicate
        );
        assert_eq!(ours["A_duplicate_1"].build, "21A101");
    }

    #[test]
    fn merge_identity_mismatch_is_fatal() {
        let mut ours = OtaMetaData::new();
        ours.insert("X".into(), artifact("X", "21A100", "17.0", "H", "U"));

        let mut theirs = OtaMetaData::new();
        theirs.insert("X".into(), artifact("X", "21A100", "17.1", "H", "U"));

        let err = merge_meta_data(&mut ours, &theirs).unwrap_err();
        assert!(matches!(err, MergeError::IdentityMismatch { key, .. } if key == "X"));
    }

    #[test]
    fn merge_unions_device_sets() {
        let mut ours = OtaMetaData::new();
        let mut local = artifact("Y", "21A100", "17.0", "H", "U");
        local.devices = vec!["iPhone11,2".into()];
        ours.insert("Y".into(), local);

        let mut theirs = OtaMetaData::new();
        let mut incoming = artifact("Y", "21A100", "17.0", "H", "U");
        incoming.devices = vec!["iPhone11,6".into()];
        theirs.insert("Y".into(), incoming);

        merge_meta_data(&mut ours, &theirs).unwrap();

        assert_eq!(
            ours["Y"].devices,
            vec!["iPhone11,2".to_string(), "iPhone11,6".to_string()]
        );
    }

    #[test]
    fn merge_does_not_touch_processing_state_of_existing_entries() {
        let mut ours = OtaMetaData::new();
        let mut local = artifact("Z", "21A100", "17.0", "H", "U");
        local.processing_state = ArtifactProcessingState::SymbolsExtracted;
        local.download_path = Some("mirror/ota/ios/17.0/21A100/Z.zip".into());
        local.last_run = 42;
        ours.insert("Z".into(), local);

        let mut theirs = OtaMetaData::new();
        theirs.insert("Z".into(), artifact("Z", "21A100", "17.0", "H", "U"));

        merge_meta_data(&mut ours, &theirs).unwrap();

        assert_eq!(
            ours["Z"].processing_state,
            ArtifactProcessingState::SymbolsExtracted
        );
        assert_eq!(
            ours["Z"].download_path.as_deref(),
            Some("mirror/ota/ios/17.0/21A100/Z.zip")
        );
        assert_eq!(ours["Z"].last_run, 42);
    }

    #[test]
    fn merge_is_idempotent() {
        let mut theirs = OtaMetaData::new();
        theirs.insert("A".into(), artifact("A", "21A100", "17.0", "H", "U"));
        theirs.insert("A_beta".into(), artifact("A", "21A99", "17.0", "H", "U"));

        let mut once = OtaMetaData::new();
        merge_meta_data(&mut once, &theirs).unwrap();
        let mut twice = once.clone();
        merge_meta_data(&mut twice, &theirs).unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn merge_duplicate_key_branch_is_idempotent() {
        let mut ours = OtaMetaData::new();
        ours.insert("A".into(), artifact("A", "21A100", "17.0", "H", "U"));

        let mut theirs = OtaMetaData::new();
        theirs.insert("A".into(), artifact("A", "21A101", "17.0", "H", "U"));

        merge_meta_data(&mut ours, &theirs).unwrap();
        let after_first = ours.clone();
        merge_meta_data(&mut ours, &theirs).unwrap();

        assert_eq!(ours, after_first);
        assert_eq!(ours.len(), 2);
    }

    #[test]
    fn duplicate_key_generation_skips_taken_keys() {
        let mut ours = OtaMetaData::new();
        let value = artifact("A", "21A100", "17.0", "H", "U");
        ours.insert("A".into(), value.clone());
        assert_eq!(generate_duplicate_key_from(&ours, "A"), "A_duplicate_1");

        ours.insert("A_duplicate_1".into(), value.clone());
        assert_eq!(generate_duplicate_key_from(&ours, "A"), "A_duplicate_2");

        ours.insert("A_duplicate_2".into(), value);
        assert_eq!(generate_duplicate_key_from(&ours, "A"), "A_duplicate_3");
    }

    #[test]
    fn unknown_fields_are_ignored_on_read() {
        let json = r#"{
            "id": "A", "build": "21A100", "version": "17.0", "platform": "ios",
            "url": "U", "hash": "H", "hash_algorithm": "SHA-1",
            "some_future_field": {"nested": true}
        }"#;
        let artifact: OtaArtifact = serde_json::from_str(json).unwrap();
        assert_eq!(artifact.build, "21A100");
        assert_eq!(artifact.processing_state, ArtifactProcessingState::Indexed);
        assert!(artifact.devices.is_empty());
    }
}
