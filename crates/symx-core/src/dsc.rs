//! `dyld_shared_cache` discovery and splitting.
//!
//! Mounted or extracted artifact roots are searched at a fixed set of
//! well-known locations for per-architecture DSC files; each hit is
//! split into per-image files by `ipsw dyld split`. Splitting is injected
//! as a closure so the failure-tolerance rules are testable without the
//! toolchain.

use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;

use symx_schema::Arch;

use crate::tools::ToolError;

/// Base name of every shared-cache file.
pub const DYLD_SHARED_CACHE: &str = "dyld_shared_cache";

/// Locations (relative to an artifact root) where DSC files live,
/// across OS generations and packaging variants.
pub const DSC_SEARCH_PATHS: [&str; 4] = [
    "System/Library/dyld/",
    "System/Library/Caches/com.apple.dyld/",
    "AssetData/payloadv2/patches/System/Library/Caches/com.apple.dyld/",
    "AssetData/payloadv2/ecc_data/System/Library/Caches/com.apple.dyld/",
];

/// Errors raised by the extraction machinery.
#[derive(Error, Debug)]
pub enum ExtractError {
    /// None of the search paths held a cache file.
    #[error("couldn't find any {DYLD_SHARED_CACHE} paths in {0}")]
    NoDscFound(PathBuf),

    /// Every discovered cache failed to split.
    #[error("split failed for all of:\n{0}")]
    AllSplitsFailed(String),

    /// `ipsw extract` finished without producing an output directory.
    #[error("couldn't find {DYLD_SHARED_CACHE} extraction directory in {0}")]
    NoExtractionDir(PathBuf),

    /// The extraction directory holds no cache root file.
    #[error("failed to find {DYLD_SHARED_CACHE} root-file in {0}")]
    NoDscRootFile(PathBuf),

    /// The OTA zip carries no cache at all.
    #[error("the OTA is a partial update without a {DYLD_SHARED_CACHE}")]
    PartialUpdate,

    /// A toolchain invocation failed.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// The symbol store failed underneath us.
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    /// Scratch-directory trouble.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One discovered DSC file together with its designated split output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DscSearchResult {
    /// Architecture the cache was built for.
    pub arch: Arch,
    /// The DSC root file.
    pub artifact: PathBuf,
    /// Where this cache's split images go.
    pub split_dir: PathBuf,
}

/// Search `input_dir` for DSC files at the known locations.
///
/// Split directories are named `{version}_{build}_{arch}` under
/// `output_dir/split_symbols`; when the same architecture shows up in
/// more than one location, later hits get a `_1`, `_2`, ... suffix so the
/// outputs stay disjoint. Finding nothing is an error -- every shipped
/// image carries at least one cache, so an empty result means we looked
/// in the wrong place.
pub fn find_dsc(
    input_dir: &Path,
    version: &str,
    build: &str,
    output_dir: &Path,
) -> Result<Vec<DscSearchResult>, ExtractError> {
    let mut counter = 1;
    let mut results: Vec<DscSearchResult> = Vec::new();

    for path_prefix in DSC_SEARCH_PATHS {
        for arch in Arch::ALL {
            let dsc_path = input_dir.join(format!("{path_prefix}{DYLD_SHARED_CACHE}_{arch}"));
            if !dsc_path.is_file() {
                continue;
            }

            let mut split_dir = output_dir
                .join("split_symbols")
                .join(format!("{version}_{build}_{arch}"));
            if results.iter().any(|result| result.split_dir == split_dir) {
                split_dir = split_dir.with_file_name(format!(
                    "{version}_{build}_{arch}_{counter}"
                ));
                counter += 1;
            }

            results.push(DscSearchResult {
                arch,
                artifact: dsc_path,
                split_dir,
            });
        }
    }

    if results.is_empty() {
        return Err(ExtractError::NoDscFound(input_dir.to_path_buf()));
    }
    Ok(results)
}

/// A split invocation: DSC root file in, split directory out.
pub type SplitFn = Box<dyn FnMut(PathBuf, PathBuf) -> BoxFuture<'static, Result<(), ToolError>>>;

/// The production splitter: `ipsw dyld split`.
pub fn ipsw_splitter() -> SplitFn {
    Box::new(|dsc, split_dir| {
        async move { crate::tools::ipsw::dyld_split(&dsc, &split_dir).await }.boxed()
    })
}

/// Split every discovered cache, tolerating individual failures.
///
/// A failed split is logged and skipped; only "all splits failed" is an
/// extraction error, because a single good architecture still yields a
/// useful symbol bundle.
pub async fn split_dsc(
    search_results: &[DscSearchResult],
    mut split: SplitFn,
) -> Result<Vec<PathBuf>, ExtractError> {
    let mut split_dirs: Vec<PathBuf> = Vec::new();

    for result in search_results {
        tracing::info!(
            artifact = %result.artifact.display(),
            arch = %result.arch,
            "splitting {DYLD_SHARED_CACHE}"
        );
        match split(result.artifact.clone(), result.split_dir.clone()).await {
            Ok(()) => split_dirs.push(result.split_dir.clone()),
            Err(err) => {
                tracing::warn!(
                    artifact = %result.artifact.display(),
                    arch = %result.arch,
                    error = %err,
                    "split failed"
                );
            }
        }
    }

    if split_dirs.is_empty() {
        let artifacts = search_results
            .iter()
            .map(|result| format!("{}_{}", result.artifact.display(), result.arch))
            .collect::<Vec<_>>()
            .join("\n");
        return Err(ExtractError::AllSplitsFailed(artifacts));
    }

    Ok(split_dirs)
}
