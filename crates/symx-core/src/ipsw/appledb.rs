//! AppleDB repository import: the IPSW index stage.
//!
//! Walks `osFiles/<platform>/<version-folder>/*.json` of the AppleDB
//! checkout, validates each file strictly, and writes every new artifact
//! into the metadata document with an individual CAS-protected update.
//! Per-item writes matter here: the mirror and extract workflows run
//! concurrently against the same document, and a full-document overwrite
//! would livelock under contention.

use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use url::Url;

use symx_schema::{
    significant_diff, IpswArtifact, IpswArtifactHashes, IpswPlatform, IpswReleaseStatus,
    IpswSource,
};

use crate::ipsw::IpswError;
use crate::meta::{load_import_state, save_import_state, IpswMetaStore};
use crate::store::ObjectStore;
use crate::tools;

/// AppleDB folder names that are never imported.
const SKIPPED_FOLDERS: [&str; 1] = ["0x - Classic"];

#[derive(Debug, Deserialize)]
struct AppleDbLink {
    url: Url,
    active: bool,
}

impl AppleDbLink {
    fn preferred(&self) -> bool {
        self.url.scheme() == "https"
    }
}

#[derive(Debug, Deserialize)]
struct AppleDbSource {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "deviceMap", default)]
    devices: Vec<String>,
    #[serde(default)]
    links: Vec<AppleDbLink>,
    #[serde(default)]
    hashes: Option<IpswArtifactHashes>,
    #[serde(default)]
    size: Option<u64>,
}

impl AppleDbSource {
    /// The first active https link, if any.
    fn link(&self) -> Option<&Url> {
        self.links
            .iter()
            .find(|link| link.preferred() && link.active)
            .map(|link| &link.url)
    }
}

#[derive(Debug, Deserialize)]
struct AppleDbArtifact {
    #[serde(default)]
    rc: Option<bool>,
    #[serde(default)]
    beta: Option<bool>,
    version: String,
    build: String,
    #[serde(default)]
    released: Option<String>,
    #[serde(default)]
    sources: Vec<AppleDbSource>,
}

impl AppleDbArtifact {
    fn release_status(&self) -> IpswReleaseStatus {
        if self.rc == Some(true) {
            IpswReleaseStatus::ReleaseCandidate
        } else if self.beta == Some(true) {
            IpswReleaseStatus::Beta
        } else {
            IpswReleaseStatus::Release
        }
    }

    /// AppleDB stores the date as a string, sometimes empty.
    fn released_date(&self) -> Option<NaiveDate> {
        let raw = self.released.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(date) => Some(date),
            Err(_) => {
                tracing::warn!(raw, "unparsable release date in AppleDB file");
                None
            }
        }
    }

    /// Convert into our schema, filtering to usable IPSW sources.
    /// `None` when no source survives the filter.
    fn into_ipsw_artifact(self, platform: IpswPlatform, run_id: u64) -> Option<IpswArtifact> {
        let release_status = self.release_status();
        let released = self.released_date();

        let sources: Vec<IpswSource> = self
            .sources
            .iter()
            .filter(|source| source.kind == "ipsw")
            .filter_map(|source| {
                source.link().map(|link| IpswSource {
                    devices: source.devices.clone(),
                    link: link.clone(),
                    hashes: source.hashes.clone(),
                    size: source.size,
                    processing_state: symx_schema::ArtifactProcessingState::Indexed,
                    mirror_path: None,
                    last_run: run_id,
                })
            })
            .collect();
        if sources.is_empty() {
            return None;
        }

        Some(IpswArtifact {
            platform,
            // Version folders use spaces where our keys use underscores.
            version: self.version.replace(' ', "_"),
            build: self.build,
            released,
            release_status,
            sources,
        })
    }
}

/// Counters reported at the end of an import run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportStats {
    /// JSON files read and considered.
    pub processed_files: usize,
    /// Files skipped because the import state already knew their hash.
    pub skipped_unchanged: usize,
    /// Artifacts dropped for lacking any usable IPSW source.
    pub without_sources: usize,
    /// Artifacts newly written to the metadata document.
    pub new_artifacts: usize,
}

/// The IPSW index stage: AppleDB checkout in, metadata items out.
pub struct AppleDbImporter {
    store: Arc<dyn ObjectStore>,
    meta: IpswMetaStore,
    run_id: u64,
}

impl std::fmt::Debug for AppleDbImporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppleDbImporter")
            .field("store", &self.store.name())
            .finish()
    }
}

impl AppleDbImporter {
    /// An importer against `store`, stamping new sources with `run_id`.
    pub fn new(store: Arc<dyn ObjectStore>, run_id: u64) -> Self {
        AppleDbImporter {
            meta: IpswMetaStore::new(store.clone()),
            store,
            run_id,
        }
    }

    /// Clone/refresh the AppleDB repository under `work_dir` and import.
    pub async fn run(&self, work_dir: &Path) -> Result<ImportStats, IpswError> {
        let repo_dir = tools::git::clone_or_update_appledb(work_dir).await?;
        self.import_from_repo(&repo_dir).await
    }

    /// Import from an existing checkout (tests point this at fixtures).
    pub async fn import_from_repo(&self, repo_dir: &Path) -> Result<ImportStats, IpswError> {
        let (mut import_state, state_generation) =
            load_import_state(self.store.as_ref()).await?;
        let (mut db, _) = self.meta.load().await?;
        let mut stats = ImportStats::default();

        for platform in IpswPlatform::ALL {
            // iPod IPSWs are museum pieces; skip them when syncing.
            if platform == IpswPlatform::IpodOs {
                continue;
            }
            let platform_dir = repo_dir.join("osFiles").join(platform.as_str());
            if !platform_dir.is_dir() {
                tracing::warn!(platform = %platform, "platform directory does not exist");
                continue;
            }

            let mut folders = Vec::new();
            let mut loose_files = Vec::new();
            for entry in std::fs::read_dir(&platform_dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    folders.push(path);
                } else if path.extension().is_some_and(|ext| ext == "json") {
                    loose_files.push(path);
                }
            }
            folders.sort();
            loose_files.sort();

            for folder in folders {
                let folder_name = folder
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if SKIPPED_FOLDERS.contains(&folder_name.as_str()) {
                    continue;
                }
                let folder_key = format!("{platform}/{folder_name}");

                let mut json_files: Vec<_> = std::fs::read_dir(&folder)?
                    .filter_map(Result::ok)
                    .map(|entry| entry.path())
                    .filter(|path| {
                        path.is_file() && path.extension().is_some_and(|ext| ext == "json")
                    })
                    .collect();
                json_files.sort();

                for file in json_files {
                    self.process_file(
                        platform,
                        &folder_key,
                        &file,
                        &mut db,
                        &mut import_state,
                        &mut stats,
                    )
                    .await?;
                }
            }

            let folder_key = platform.to_string();
            for file in loose_files {
                self.process_file(
                    platform,
                    &folder_key,
                    &file,
                    &mut db,
                    &mut import_state,
                    &mut stats,
                )
                .await?;
            }
        }

        save_import_state(self.store.as_ref(), &import_state, state_generation).await?;
        tracing::info!(
            processed = stats.processed_files,
            skipped = stats.skipped_unchanged,
            without_sources = stats.without_sources,
            new = stats.new_artifacts,
            "AppleDB import finished"
        );
        Ok(stats)
    }

    async fn process_file(
        &self,
        platform: IpswPlatform,
        folder_key: &str,
        file: &Path,
        db: &mut symx_schema::IpswArtifactDb,
        import_state: &mut crate::meta::ImportState,
        stats: &mut ImportStats,
    ) -> Result<(), IpswError> {
        let body = std::fs::read(file)?;
        let file_hash = hex::encode(Sha256::digest(&body));
        if import_state.contains(folder_key, &file_hash) {
            stats.skipped_unchanged += 1;
            return Ok(());
        }
        stats.processed_files += 1;

        let src_artifact: AppleDbArtifact = match serde_json::from_slice(&body) {
            Ok(artifact) => artifact,
            Err(err) => {
                tracing::warn!(file = %file.display(), error = %err, "failed to validate AppleDB artifact");
                import_state.record(folder_key, file_hash);
                return Ok(());
            }
        };

        let Some(artifact) = src_artifact.into_ipsw_artifact(platform, self.run_id) else {
            tracing::warn!(file = %file.display(), "IPSW artifact has no usable sources and won't be imported");
            stats.without_sources += 1;
            import_state.record(folder_key, file_hash);
            return Ok(());
        };

        let key = artifact.key();
        if let Some(existing) = db.get(&key) {
            // Only workflow state may drift for a known key; anything
            // else means AppleDB rewrote the record under us.
            if significant_diff(existing, &artifact) {
                tracing::warn!(
                    %key,
                    file = %file.display(),
                    "AppleDB changed an already-imported artifact; keeping ours"
                );
            }
        } else {
            self.meta.update_item(&artifact).await?;
            db.upsert(key, artifact);
            stats.new_artifacts += 1;
        }

        import_state.record(folder_key, file_hash);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const IOS_FILE: &str = r#"{
        "osStr": "iOS",
        "version": "18.2",
        "build": "22C152",
        "released": "2024-12-11",
        "sources": [
            {
                "type": "ipsw",
                "deviceMap": ["iPhone14,7"],
                "links": [
                    {"url": "http://mirror.example.com/a.ipsw", "active": true},
                    {"url": "https://updates.cdn-apple.com/iPhone14,7_18.2_22C152_Restore.ipsw", "active": true}
                ],
                "hashes": {"sha1": "abc", "sha2-256": "def"},
                "size": 6400000000
            },
            {
                "type": "installassistant",
                "deviceMap": [],
                "links": []
            }
        ]
    }"#;

    fn parse(json: &str) -> AppleDbArtifact {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn converts_appledb_file_to_artifact() {
        let artifact = parse(IOS_FILE)
            .into_ipsw_artifact(IpswPlatform::Ios, 11)
            .unwrap();

        assert_eq!(artifact.key(), "iOS_18.2_22C152");
        assert_eq!(artifact.released, NaiveDate::from_ymd_opt(2024, 12, 11));
        assert_eq!(artifact.release_status, IpswReleaseStatus::Release);
        // Only the active https ipsw link survives.
        assert_eq!(artifact.sources.len(), 1);
        assert_eq!(artifact.sources[0].link.scheme(), "https");
        assert_eq!(artifact.sources[0].sha1(), Some("abc"));
        assert_eq!(artifact.sources[0].size, Some(6_400_000_000));
        assert_eq!(artifact.sources[0].last_run, 11);
    }

    #[test]
    fn beta_and_rc_flags_set_release_status() {
        let beta = parse(r#"{"version": "18.3", "build": "22D5034e", "beta": true}"#);
        assert_eq!(beta.release_status(), IpswReleaseStatus::Beta);

        let rc = parse(r#"{"version": "18.3", "build": "22D60", "rc": true}"#);
        assert_eq!(rc.release_status(), IpswReleaseStatus::ReleaseCandidate);
    }

    #[test]
    fn empty_released_string_is_none() {
        let artifact = parse(r#"{"version": "1.0", "build": "1A1", "released": ""}"#);
        assert_eq!(artifact.released_date(), None);
    }

    #[test]
    fn version_spaces_become_underscores() {
        let json = r#"{
            "version": "15.0 beta 2",
            "build": "24A5279h",
            "sources": [{
                "type": "ipsw",
                "deviceMap": ["Mac14,2"],
                "links": [{"url": "https://example.com/UniversalMac.ipsw", "active": true}]
            }]
        }"#;
        let artifact = parse(json)
            .into_ipsw_artifact(IpswPlatform::MacOs, 0)
            .unwrap();
        assert_eq!(artifact.version, "15.0_beta_2");
        assert_eq!(artifact.key(), "macOS_15.0_beta_2_24A5279h");
    }

    #[test]
    fn artifact_without_usable_sources_is_dropped() {
        let json = r#"{
            "version": "18.2",
            "build": "22C152",
            "sources": [{
                "type": "ipsw",
                "deviceMap": ["iPhone14,7"],
                "links": [{"url": "https://example.com/gone.ipsw", "active": false}]
            }]
        }"#;
        assert!(parse(json)
            .into_ipsw_artifact(IpswPlatform::Ios, 0)
            .is_none());
    }

    fn write_fixture_repo(root: &Path) {
        let folder = root.join("osFiles/iOS/18.x - 22x");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join("22C152.json"), IOS_FILE).unwrap();
    }

    #[tokio::test]
    async fn import_writes_new_artifacts_and_import_state() {
        let repo = tempfile::tempdir().unwrap();
        write_fixture_repo(repo.path());
        let store = Arc::new(MemoryStore::new());

        let importer = AppleDbImporter::new(store.clone(), 5);
        let stats = importer.import_from_repo(repo.path()).await.unwrap();

        assert_eq!(stats.processed_files, 1);
        assert_eq!(stats.new_artifacts, 1);

        let (db, _) = IpswMetaStore::new(store.clone()).load().await.unwrap();
        assert!(db.contains("iOS_18.2_22C152"));

        let (state, _) = load_import_state(store.as_ref()).await.unwrap();
        assert_eq!(state.folder_hashes["iOS/18.x - 22x"].len(), 1);
    }

    #[tokio::test]
    async fn rerunning_an_unchanged_snapshot_is_a_near_noop() {
        let repo = tempfile::tempdir().unwrap();
        write_fixture_repo(repo.path());
        let store = Arc::new(MemoryStore::new());

        let importer = AppleDbImporter::new(store.clone(), 5);
        importer.import_from_repo(repo.path()).await.unwrap();
        let stats = importer.import_from_repo(repo.path()).await.unwrap();

        assert_eq!(stats.processed_files, 0);
        assert_eq!(stats.skipped_unchanged, 1);
        assert_eq!(stats.new_artifacts, 0);
    }

    #[tokio::test]
    async fn existing_keys_are_not_overwritten() {
        let repo = tempfile::tempdir().unwrap();
        write_fixture_repo(repo.path());
        let store = Arc::new(MemoryStore::new());
        let meta = IpswMetaStore::new(store.clone());

        let importer = AppleDbImporter::new(store.clone(), 5);
        importer.import_from_repo(repo.path()).await.unwrap();

        // Mirror worker advances a source in the meantime.
        let (mut db, generation) = meta.load().await.unwrap();
        let mut artifact = db.get("iOS_18.2_22C152").unwrap().clone();
        artifact.sources[0].processing_state =
            symx_schema::ArtifactProcessingState::Mirrored;
        db.upsert(artifact.key(), artifact);
        meta.save(&db, generation).await.unwrap();

        // Touch the file so the import state doesn't short-circuit.
        let file = repo.path().join("osFiles/iOS/18.x - 22x/22C152.json");
        let body = std::fs::read_to_string(&file).unwrap();
        std::fs::write(&file, body.replace("2024-12-11", "2024-12-12")).unwrap();

        importer.import_from_repo(repo.path()).await.unwrap();

        let (db, _) = meta.load().await.unwrap();
        assert_eq!(
            db.get("iOS_18.2_22C152").unwrap().sources[0].processing_state,
            symx_schema::ArtifactProcessingState::Mirrored
        );
    }
}
