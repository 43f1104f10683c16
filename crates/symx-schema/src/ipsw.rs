//! IPSW artifact schema: platforms, restore-image sources, and the
//! versioned metadata envelope.
//!
//! An IPSW artifact is identified by its `{platform}_{version}_{build}`
//! triple and carries one source per device family; each source advances
//! through the processing-state machine independently.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::state::ArtifactProcessingState;

/// Platforms that ship IPSW restore images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpswPlatform {
    /// HomePod.
    #[serde(rename = "audioOS")]
    AudioOs,
    /// The Touch Bar / T2 coprocessor.
    #[serde(rename = "bridgeOS")]
    BridgeOs,
    /// iPhone.
    #[serde(rename = "iOS")]
    Ios,
    /// iPad.
    #[serde(rename = "iPadOS")]
    IpadOs,
    /// iPod touch (historical).
    #[serde(rename = "iPodOS")]
    IpodOs,
    /// Mac restore images.
    #[serde(rename = "macOS")]
    MacOs,
    /// Apple TV.
    #[serde(rename = "tvOS")]
    TvOs,
    /// Vision Pro.
    #[serde(rename = "visionOS")]
    VisionOs,
    /// Apple Watch.
    #[serde(rename = "watchOS")]
    WatchOs,
}

impl IpswPlatform {
    /// All platforms, in AppleDB directory order.
    pub const ALL: [IpswPlatform; 9] = [
        IpswPlatform::AudioOs,
        IpswPlatform::BridgeOs,
        IpswPlatform::Ios,
        IpswPlatform::IpadOs,
        IpswPlatform::IpodOs,
        IpswPlatform::MacOs,
        IpswPlatform::TvOs,
        IpswPlatform::VisionOs,
        IpswPlatform::WatchOs,
    ];

    /// The mixed-case name as used by AppleDB directories and our keys.
    pub fn as_str(self) -> &'static str {
        match self {
            IpswPlatform::AudioOs => "audioOS",
            IpswPlatform::BridgeOs => "bridgeOS",
            IpswPlatform::Ios => "iOS",
            IpswPlatform::IpadOs => "iPadOS",
            IpswPlatform::IpodOs => "iPodOS",
            IpswPlatform::MacOs => "macOS",
            IpswPlatform::TvOs => "tvOS",
            IpswPlatform::VisionOs => "visionOS",
            IpswPlatform::WatchOs => "watchOS",
        }
    }

    /// Symbol-store prefix for this platform.
    ///
    /// IPSWs differentiate between iPadOS and iOS while OTAs do not, so
    /// both land under the same prefix; prefixes are all lower-case.
    pub fn symbol_prefix(self) -> String {
        match self {
            IpswPlatform::IpadOs => IpswPlatform::Ios.as_str().to_lowercase(),
            other => other.as_str().to_lowercase(),
        }
    }
}

impl std::fmt::Display for IpswPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Release channel of an IPSW artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpswReleaseStatus {
    /// General availability.
    #[serde(rename = "rel")]
    Release,
    /// Release candidate.
    #[serde(rename = "rc")]
    ReleaseCandidate,
    /// Developer/public beta.
    #[serde(rename = "beta")]
    Beta,
}

/// Content hashes attached to an IPSW source.
///
/// AppleDB spells the SHA-256 field `sha2-256`; our own documents use the
/// short form, so both are accepted on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct IpswArtifactHashes {
    /// Hex SHA-1, used for download verification.
    #[serde(default)]
    pub sha1: Option<String>,
    /// Hex SHA-256, recorded but not currently verified against.
    #[serde(default, alias = "sha2-256")]
    pub sha2: Option<String>,
}

/// One downloadable restore image within an IPSW artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpswSource {
    /// Device model strings this image restores.
    pub devices: Vec<String>,
    /// Download link at the Apple CDN.
    pub link: Url,
    /// Content hashes, when AppleDB knows them.
    #[serde(default)]
    pub hashes: Option<IpswArtifactHashes>,
    /// Payload size in bytes, when AppleDB knows it.
    #[serde(default)]
    pub size: Option<u64>,
    /// Where this source stands in the pipeline.
    #[serde(default)]
    pub processing_state: ArtifactProcessingState,
    /// Mirror key of the uploaded blob, if mirrored.
    #[serde(default)]
    pub mirror_path: Option<String>,
    /// Workflow-run id of the most recent mutation.
    #[serde(default)]
    pub last_run: u64,
}

impl IpswSource {
    /// Basename of the link path (e.g. `iPhone14,7_18.2_22C152_Restore.ipsw`).
    pub fn file_name(&self) -> String {
        self.link
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or_default()
            .to_string()
    }

    /// The recorded SHA-1, if any.
    pub fn sha1(&self) -> Option<&str> {
        self.hashes.as_ref().and_then(|h| h.sha1.as_deref())
    }
}

/// A restore-image release: one platform/version/build triple with one
/// source per device family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpswArtifact {
    /// Platform this release ships for.
    pub platform: IpswPlatform,
    /// Marketing version (e.g. `18.2`).
    pub version: String,
    /// Apple build number (e.g. `22C152`).
    pub build: String,
    /// Release date according to AppleDB; drives mirror-candidate
    /// filtering and ordering.
    #[serde(default)]
    pub released: Option<NaiveDate>,
    /// Release channel.
    pub release_status: IpswReleaseStatus,
    /// One restore image per device family.
    pub sources: Vec<IpswSource>,
}

impl IpswArtifact {
    /// Stable map key: `{platform}_{version}_{build}`.
    pub fn key(&self) -> String {
        format!("{}_{}_{}", self.platform, self.version, self.build)
    }

    /// Whether any source is in the given state.
    pub fn any_source(&self, pred: impl Fn(ArtifactProcessingState) -> bool) -> bool {
        self.sources.iter().any(|s| pred(s.processing_state))
    }
}

/// The authoritative IPSW metadata document. The outer envelope carries a
/// schema version so the wire format can evolve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpswArtifactDb {
    /// Schema version of this document.
    #[serde(default)]
    pub version: u32,
    /// All known artifacts, keyed by [`IpswArtifact::key`].
    #[serde(default)]
    pub artifacts: BTreeMap<String, IpswArtifact>,
}

impl IpswArtifactDb {
    /// Whether an artifact with this key is recorded.
    pub fn contains(&self, key: &str) -> bool {
        self.artifacts.contains_key(key)
    }

    /// Look up an artifact by key.
    pub fn get(&self, key: &str) -> Option<&IpswArtifact> {
        self.artifacts.get(key)
    }

    /// Insert or replace an artifact under `key`.
    pub fn upsert(&mut self, key: String, artifact: IpswArtifact) {
        self.artifacts.insert(key, artifact);
    }
}

/// Whether two records of the same key differ in AppleDB-sourced data.
///
/// Workflow state (`processing_state`, `mirror_path`, `last_run`) is ours,
/// not AppleDB's, and is ignored; everything else (version, build, dates,
/// hashes, the source list itself) is significant and worth surfacing when
/// upstream rewrites history.
pub fn significant_diff(ours: &IpswArtifact, theirs: &IpswArtifact) -> bool {
    fn normalize(artifact: &IpswArtifact) -> IpswArtifact {
        let mut normalized = artifact.clone();
        for source in &mut normalized.sources {
            source.processing_state = ArtifactProcessingState::Indexed;
            source.mirror_path = None;
            source.last_run = 0;
        }
        normalized
    }

    normalize(ours) != normalize(theirs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(link: &str) -> IpswSource {
        IpswSource {
            devices: vec!["iPhone14,7".into()],
            link: Url::parse(link).unwrap(),
            hashes: None,
            size: None,
            processing_state: ArtifactProcessingState::Indexed,
            mirror_path: None,
            last_run: 0,
        }
    }

    fn artifact(version: &str, build: &str) -> IpswArtifact {
        IpswArtifact {
            platform: IpswPlatform::Ios,
            version: version.to_string(),
            build: build.to_string(),
            released: None,
            release_status: IpswReleaseStatus::Release,
            sources: vec![source(
                "https://updates.cdn-apple.com/2024/fullrestores/072-42532/iPhone14,7_18.2_22C152_Restore.ipsw",
            )],
        }
    }

    #[test]
    fn key_is_platform_version_build() {
        assert_eq!(artifact("18.2", "22C152").key(), "iOS_18.2_22C152");
    }

    #[test]
    fn file_name_is_link_basename() {
        let artifact = artifact("18.2", "22C152");
        assert_eq!(
            artifact.sources[0].file_name(),
            "iPhone14,7_18.2_22C152_Restore.ipsw"
        );
    }

    #[test]
    fn symbol_prefix_folds_ipados_into_ios() {
        assert_eq!(IpswPlatform::IpadOs.symbol_prefix(), "ios");
        assert_eq!(IpswPlatform::MacOs.symbol_prefix(), "macos");
        for platform in IpswPlatform::ALL {
            let prefix = platform.symbol_prefix();
            assert_eq!(prefix, prefix.to_lowercase());
        }
    }

    #[test]
    fn hashes_accept_appledb_spelling() {
        let hashes: IpswArtifactHashes =
            serde_json::from_str(r#"{"sha1": "abc", "sha2-256": "def"}"#).unwrap();
        assert_eq!(hashes.sha1.as_deref(), Some("abc"));
        assert_eq!(hashes.sha2.as_deref(), Some("def"));

        // Our own documents round-trip with the short name.
        let json = serde_json::to_string(&hashes).unwrap();
        let back: IpswArtifactHashes = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hashes);
    }

    #[test]
    fn platform_serializes_mixed_case() {
        let json = serde_json::to_string(&IpswPlatform::WatchOs).unwrap();
        assert_eq!(json, "\"watchOS\"");
        let back: IpswPlatform = serde_json::from_str("\"iPadOS\"").unwrap();
        assert_eq!(back, IpswPlatform::IpadOs);
    }

    #[test]
    fn db_envelope_round_trips() {
        let mut db = IpswArtifactDb::default();
        let artifact = artifact("18.2", "22C152");
        db.upsert(artifact.key(), artifact);

        let json = serde_json::to_string(&db).unwrap();
        let back: IpswArtifactDb = serde_json::from_str(&json).unwrap();
        assert_eq!(back, db);
        assert!(back.contains("iOS_18.2_22C152"));
    }

    #[test]
    fn identical_artifacts_have_no_significant_diff() {
        let a = artifact("17.0", "21A100");
        assert!(!significant_diff(&a, &a.clone()));
    }

    #[test]
    fn version_and_build_changes_are_significant() {
        assert!(significant_diff(
            &artifact("17.0", "21A100"),
            &artifact("17.1", "21A100")
        ));
        assert!(significant_diff(
            &artifact("17.0", "21A100"),
            &artifact("17.0", "21A101")
        ));
    }

    #[test]
    fn source_list_changes_are_significant() {
        let a = artifact("17.0", "21A100");
        let mut b = a.clone();
        b.sources.push(source("https://example.com/other.ipsw"));
        assert!(significant_diff(&a, &b));
    }

    #[test]
    fn workflow_state_changes_are_ignored() {
        let a = artifact("17.0", "21A100");
        let mut b = a.clone();
        b.sources[0].processing_state = ArtifactProcessingState::Mirrored;
        b.sources[0].mirror_path = Some("mirror/ipsw/iOS/17.0/21A100/x.ipsw".into());
        b.sources[0].last_run = 200;
        assert!(!significant_diff(&a, &b));
    }
}
