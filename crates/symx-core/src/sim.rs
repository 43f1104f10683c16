//! Simulator-runtime symbol extraction.
//!
//! A local-disk mode without metadata-store integration: Xcode drops
//! simulator `dyld_sim_shared_cache_*` files under the CoreSimulator
//! caches directory; each one is split, symsorted, and uploaded under a
//! `sim_...` bundle id.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::dsc::ExtractError;
use crate::store::{ObjectStore, StoreError};
use crate::symbols;
use crate::tools::{self, ToolError};

const SIMULATOR_RUNTIME_PREFIX: &str = "com.apple.CoreSimulator.SimRuntime.";
const DSC_PREFIX: &str = "dyld_sim_shared_cache_";
const IGNORED_DSC_SUFFIXES: [&str; 3] = ["map", "dylddata", "atlas"];

const CACHES_PATH: &str = "/Library/Developer/CoreSimulator/Caches/dyld";

/// Errors raised by simulator extraction.
#[derive(Error, Debug)]
pub enum SimError {
    /// No CoreSimulator caches directory on this host.
    #[error("neither the root nor the per-user CoreSimulator caches directory exists")]
    NoCachesDir,

    /// A toolchain invocation failed.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// The extraction machinery failed.
    #[error(transparent)]
    Extract(#[from] ExtractError),

    /// The symbol store failed underneath us.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Local filesystem trouble.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One installed simulator runtime image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorRuntime {
    /// Host macOS build the caches were produced under.
    pub macos_version: String,
    /// Simulated OS (`ios`, `watchos`, ...), lower-case.
    pub os_name: String,
    /// Simulated OS version (`17.0`).
    pub os_version: String,
    /// Runtime build number.
    pub build_number: String,
    /// Directory holding the `dyld_sim_shared_cache_*` files.
    pub path: PathBuf,
}

impl SimulatorRuntime {
    /// Bundle id for one architecture's caches of this runtime.
    pub fn bundle_id(&self, arch: &str) -> String {
        format!(
            "sim_{}_{}_{}_{}",
            self.macos_version, self.os_version, self.build_number, arch
        )
    }
}

/// Parse `com.apple.CoreSimulator.SimRuntime.iOS-17-0.21A328` into
/// (os_name, os_version, build_number).
pub fn parse_runtime_dir_name(name: &str) -> Option<(String, String, String)> {
    let rest = name.strip_prefix(SIMULATOR_RUNTIME_PREFIX)?;
    let (os_part, build_number) = rest.split_once('.')?;
    let mut os_info = os_part.split('-');
    let os_name = os_info.next()?.to_lowercase();
    let version_parts: Vec<&str> = os_info.collect();
    if version_parts.is_empty() {
        return None;
    }
    Some((
        os_name,
        version_parts.join("."),
        build_number.to_string(),
    ))
}

fn is_ignored_dsc_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return true;
    };
    if !name.starts_with(DSC_PREFIX) {
        return true;
    }
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IGNORED_DSC_SUFFIXES.contains(&ext))
}

/// Where this host keeps simulator cache images.
///
/// Starting with Xcode 16 the caches live under the root Library folder;
/// before that they were per-user.
pub fn retrieve_caches_path() -> Result<PathBuf, SimError> {
    let root_path = PathBuf::from(CACHES_PATH);
    if root_path.is_dir() {
        return Ok(root_path);
    }
    if let Some(home) = std::env::var_os("HOME") {
        let user_path = PathBuf::from(home).join(CACHES_PATH.trim_start_matches('/'));
        if user_path.is_dir() {
            return Ok(user_path);
        }
    }
    Err(SimError::NoCachesDir)
}

/// Discover all simulator runtimes below the caches directory.
pub fn find_simulator_runtimes(caches_path: &Path) -> Result<Vec<SimulatorRuntime>, SimError> {
    let mut runtimes = Vec::new();

    for macos_entry in std::fs::read_dir(caches_path)? {
        let macos_build_path = macos_entry?.path();
        if !macos_build_path.is_dir() {
            continue;
        }
        let macos_version = macos_build_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        for runtime_entry in std::fs::read_dir(&macos_build_path)? {
            let runtime_path = runtime_entry?.path();
            let Some(dir_name) = runtime_path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let Some((os_name, os_version, build_number)) = parse_runtime_dir_name(dir_name)
            else {
                continue;
            };
            runtimes.push(SimulatorRuntime {
                macos_version: macos_version.clone(),
                os_name,
                os_version,
                build_number,
                path: runtime_path,
            });
        }
    }

    runtimes.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(runtimes)
}

/// Split, symsort, and upload every runtime found on this host.
pub async fn extract_simulator_symbols(store: Arc<dyn ObjectStore>) -> Result<(), SimError> {
    let caches_path = retrieve_caches_path()?;
    let runtimes = find_simulator_runtimes(&caches_path)?;
    tracing::info!(count = runtimes.len(), "found simulator runtimes");

    for runtime in runtimes {
        extract_runtime(store.clone(), &runtime).await?;
    }
    Ok(())
}

async fn extract_runtime(
    store: Arc<dyn ObjectStore>,
    runtime: &SimulatorRuntime,
) -> Result<(), SimError> {
    let output_dir = tempfile::tempdir()?;
    let mut bundle_ids = Vec::new();

    for entry in std::fs::read_dir(&runtime.path)? {
        let dsc_file = entry?.path();
        if is_ignored_dsc_file(&dsc_file) {
            continue;
        }
        let arch = dsc_file
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix(DSC_PREFIX))
            .unwrap_or_default()
            .to_string();
        let bundle_id = runtime.bundle_id(&arch);
        tracing::info!(
            runtime = %runtime.path.display(),
            %arch,
            %bundle_id,
            "extracting simulator symbols"
        );

        let split_dir = tempfile::tempdir()?;
        tools::ipsw::dyld_split(&dsc_file, split_dir.path()).await?;
        tools::symsorter::symsort(
            split_dir.path(),
            output_dir.path(),
            &runtime.os_name,
            &bundle_id,
            false,
        )
        .await?;
        bundle_ids.push(bundle_id);
    }

    if bundle_ids.is_empty() {
        tracing::warn!(runtime = %runtime.path.display(), "no shared-cache files in runtime");
        return Ok(());
    }

    symbols::upload_symbol_binaries(store, output_dir.path()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_runtime_dir_names() {
        let (os_name, os_version, build) =
            parse_runtime_dir_name("com.apple.CoreSimulator.SimRuntime.iOS-17-0.21A328").unwrap();
        assert_eq!(os_name, "ios");
        assert_eq!(os_version, "17.0");
        assert_eq!(build, "21A328");

        let (os_name, os_version, _) =
            parse_runtime_dir_name("com.apple.CoreSimulator.SimRuntime.watchOS-10-2.21S364")
                .unwrap();
        assert_eq!(os_name, "watchos");
        assert_eq!(os_version, "10.2");
    }

    #[test]
    fn rejects_non_runtime_dir_names() {
        assert!(parse_runtime_dir_name("com.apple.dyld").is_none());
        assert!(parse_runtime_dir_name("com.apple.CoreSimulator.SimRuntime.iOS17").is_none());
    }

    #[test]
    fn bundle_id_contains_all_coordinates() {
        let runtime = SimulatorRuntime {
            macos_version: "23B74".into(),
            os_name: "ios".into(),
            os_version: "17.0".into(),
            build_number: "21A328".into(),
            path: PathBuf::new(),
        };
        assert_eq!(runtime.bundle_id("arm64e"), "sim_23B74_17.0_21A328_arm64e");
    }

    #[test]
    fn ignores_sidecar_dsc_files() {
        assert!(is_ignored_dsc_file(Path::new(
            "dyld_sim_shared_cache_arm64e.map"
        )));
        assert!(is_ignored_dsc_file(Path::new(
            "dyld_sim_shared_cache_arm64e.atlas"
        )));
        assert!(is_ignored_dsc_file(Path::new("other_file")));
        assert!(!is_ignored_dsc_file(Path::new(
            "dyld_sim_shared_cache_arm64e"
        )));
    }

    #[test]
    fn discovers_runtimes_in_fixture_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime_dir = tmp
            .path()
            .join("23B74")
            .join("com.apple.CoreSimulator.SimRuntime.iOS-17-0.21A328");
        std::fs::create_dir_all(&runtime_dir).unwrap();
        std::fs::write(runtime_dir.join("dyld_sim_shared_cache_arm64e"), b"").unwrap();
        std::fs::create_dir_all(tmp.path().join("23B74/unrelated-dir")).unwrap();

        let runtimes = find_simulator_runtimes(tmp.path()).unwrap();
        assert_eq!(runtimes.len(), 1);
        assert_eq!(runtimes[0].macos_version, "23B74");
        assert_eq!(runtimes[0].os_name, "ios");
        assert_eq!(runtimes[0].os_version, "17.0");
        assert_eq!(runtimes[0].build_number, "21A328");
    }
}
