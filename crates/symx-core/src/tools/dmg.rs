//! `hdiutil` wrappers for mounting cryptex DMGs on the host.

use std::path::{Path, PathBuf};

use super::{run_tool, ToolError};

/// One mounted volume as reported by `hdiutil mount`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    /// Device node (e.g. `/dev/disk5s1`), used for detach.
    pub dev: String,
    /// Partition identifier.
    pub id: String,
    /// Mount point.
    pub point: PathBuf,
}

/// Parse the mount table printed by `hdiutil mount`.
///
/// The volume of interest is the last line; columns are device,
/// partition id, mount point (the mount point may contain spaces).
pub fn parse_hdiutil_mount_output(stdout: &str) -> Result<MountInfo, ToolError> {
    let last_line = stdout.lines().last().unwrap_or_default();
    let mut fields = last_line.split_whitespace();

    let (Some(dev), Some(id)) = (fields.next(), fields.next()) else {
        return Err(ToolError::Parse {
            tool: "hdiutil mount".to_string(),
            message: format!("unexpected mount table line: '{last_line}'"),
        });
    };
    let point: Vec<&str> = fields.collect();
    if point.is_empty() {
        return Err(ToolError::Parse {
            tool: "hdiutil mount".to_string(),
            message: format!("mount table line has no mount point: '{last_line}'"),
        });
    }

    Ok(MountInfo {
        dev: dev.to_string(),
        id: id.to_string(),
        point: PathBuf::from(point.join(" ")),
    })
}

/// Mount a DMG and report where it landed.
pub async fn mount_dmg(dmg: &Path) -> Result<MountInfo, ToolError> {
    let output = run_tool(
        "hdiutil",
        ["mount".as_ref(), dmg.as_os_str()],
        None,
        None,
    )
    .await?
    .require_success("hdiutil mount")?;
    parse_hdiutil_mount_output(&output.stdout)
}

/// Detach a previously mounted device node.
pub async fn detach_dev(dev: &str) -> Result<(), ToolError> {
    let output = run_tool("hdiutil", ["detach", dev], None, None)
        .await?
        .require_success("hdiutil detach")?;
    tracing::debug!(dev, stdout = %output.stdout.trim(), "detached volume");
    Ok(())
}
