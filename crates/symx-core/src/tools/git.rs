//! AppleDB Git repository management for the IPSW index stage.

use std::path::{Path, PathBuf};

use super::{run_tool, ToolError};

/// Upstream AppleDB repository.
pub const APPLEDB_REPO_URL: &str = "https://github.com/littlebyteorg/appledb.git";

/// Clone or fast-forward the AppleDB repository under `target_dir`.
///
/// A failing `git pull --ff-only` (force-pushed upstream, dirty checkout)
/// removes the checkout and clones fresh; a shallow clone is all the
/// index stage needs.
pub async fn clone_or_update_appledb(target_dir: &Path) -> Result<PathBuf, ToolError> {
    clone_or_update(APPLEDB_REPO_URL, target_dir).await
}

async fn clone_or_update(repo_url: &str, target_dir: &Path) -> Result<PathBuf, ToolError> {
    let repo_dir = target_dir.join("appledb");

    if repo_dir.exists() {
        tracing::info!(repo_dir = %repo_dir.display(), "updating existing appledb repository");
        let output = run_tool("git", ["pull", "--ff-only"], Some(&repo_dir), None).await?;
        if output.success() {
            return Ok(repo_dir);
        }
        tracing::warn!(
            stderr = %output.stderr.trim(),
            "git pull failed, removing and re-cloning"
        );
        tokio::fs::remove_dir_all(&repo_dir).await?;
    }

    tracing::info!(repo_dir = %repo_dir.display(), "cloning appledb repository");
    run_tool(
        "git",
        [
            "clone".as_ref(),
            "--depth".as_ref(),
            "1".as_ref(),
            repo_url.as_ref(),
            repo_dir.as_os_str(),
        ],
        None,
        None,
    )
    .await?
    .require_success("git clone")?;

    Ok(repo_dir)
}
