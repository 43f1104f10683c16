//! Invocations of the external `ipsw` firmware toolkit.
//!
//! Each wrapper owns one documented output contract; the parsing half is
//! a pure function over captured text so the contracts stay testable
//! without the binary installed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use symx_schema::Arch;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::{run_tool, ToolError, ToolOutput};

/// `ipsw extract` is typically done in a couple of minutes; anything
/// beyond this is stuck on a DMG-mounter prompt and must be killed.
pub const EXTRACT_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// How long to wait for `ipsw mount` to report its mount point.
const MOUNT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Version: (.*),").unwrap())
}

fn device_row_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\|\s([\w,\-]*)\s*\|\s([a-z0-9]*)\s*\|\s([\w,\-()\. ]*)\s*\|\s([a-z0-9]*)\s*\|\s([a-z0-9]*)\s*\|\s(\d*)",
        )
        .unwrap()
    })
}

fn patch_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Patching (.*) to (.*)").unwrap())
}

fn mount_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Mounted sys DMG (.*)").unwrap())
}

/// Parse the version out of `ipsw version` stdout.
pub fn parse_ipsw_version(stdout: &str) -> Result<String, ToolError> {
    version_re()
        .captures(stdout)
        .map(|captures| captures[1].to_string())
        .ok_or_else(|| ToolError::Parse {
            tool: "ipsw version".to_string(),
            message: format!("couldn't parse version from output: {stdout}"),
        })
}

/// Installed `ipsw` version; fatal when absent or unparsable.
pub async fn ipsw_version() -> Result<String, ToolError> {
    which::which("ipsw").map_err(|_| ToolError::NotInstalled("ipsw".to_string()))?;
    let output = run_tool("ipsw", ["version"], None, None)
        .await?
        .require_success("ipsw version")?;
    parse_ipsw_version(&output.stdout)
}

/// One row of the `ipsw device-list` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Product identifier (e.g. `iPhone14,7`).
    pub product: String,
    /// Board model string.
    pub model: String,
    /// Marketing name.
    pub description: String,
    /// SoC identifier.
    pub cpu: String,
    /// CPU architecture.
    pub arch: Arch,
    /// Memory class bucket.
    pub mem_class: u32,
}

impl Device {
    /// Product name as used in artifact searches; board-revision suffixes
    /// are not part of the search identity.
    pub fn search_name(&self) -> &str {
        self.product
            .strip_suffix("-A")
            .or_else(|| self.product.strip_suffix("-B"))
            .unwrap_or(&self.product)
    }
}

/// Parse the pipe-table emitted by `ipsw device-list`.
pub fn parse_device_list(stdout: &str) -> Vec<Device> {
    let mut data_start = false;
    let mut devices = Vec::new();

    for line in stdout.lines() {
        if data_start {
            if let Some(captures) = device_row_re().captures(line) {
                let Ok(arch) = captures[5].parse::<Arch>() else {
                    continue;
                };
                devices.push(Device {
                    product: captures[1].to_string(),
                    model: captures[2].to_string(),
                    description: captures[3].trim().to_string(),
                    cpu: captures[4].to_string(),
                    arch,
                    mem_class: captures[6].parse().unwrap_or(0),
                });
            }
        } else if line.starts_with("|--") {
            data_start = true;
        }
    }

    devices
}

/// The full device table known to `ipsw`.
pub async fn device_list() -> Result<Vec<Device>, ToolError> {
    let output = run_tool("ipsw", ["device-list"], None, None)
        .await?
        .require_success("ipsw device-list")?;
    Ok(parse_device_list(&output.stdout))
}

/// Ask Apple for the current OTA URL list of one platform/channel.
///
/// The raw output is returned unclassified: exit 1 with a 403 in stderr
/// is an intermittent availability issue the index stage downgrades to a
/// warning rather than aborting the whole sync.
pub async fn download_ota_urls(platform: &str, beta: bool) -> Result<ToolOutput, ToolError> {
    let mut args = vec![
        "download", "ota", "--platform", platform, "--urls", "--json",
    ];
    if beta {
        args.push("--beta");
    }
    run_tool("ipsw", args, None, None).await
}

/// Parse the `Patching <name> to <path>` stderr lines of `ipsw ota patch`.
pub fn parse_cryptex_patch_output(stderr: &str) -> BTreeMap<String, PathBuf> {
    let mut dmg_files = BTreeMap::new();
    for line in stderr.lines() {
        if let Some(captures) = patch_line_re().captures(line) {
            dmg_files.insert(captures[1].to_string(), PathBuf::from(&captures[2]));
        }
    }
    dmg_files
}

/// Try to patch a cryptex-packaged OTA into its DMGs.
///
/// Returns an empty map for non-cryptex OTAs (the caller falls back to
/// legacy extraction).
pub async fn ota_patch(
    artifact: &Path,
    output_dir: &Path,
) -> Result<BTreeMap<String, PathBuf>, ToolError> {
    let output = run_tool(
        "ipsw",
        [
            "ota".as_ref(),
            "patch".as_ref(),
            artifact.as_os_str(),
            "--output".as_ref(),
            output_dir.as_os_str(),
        ],
        None,
        None,
    )
    .await?;

    if output.success() && !output.stderr.is_empty() {
        Ok(parse_cryptex_patch_output(&output.stderr))
    } else {
        Ok(BTreeMap::new())
    }
}

/// Extract the `dyld_shared_cache` payload out of a legacy OTA zip.
///
/// The caller inspects the exit status and the extraction directory: exit
/// 1 with nothing extracted means the zip is a partial update without a
/// DSC, which is a classification, not a tool failure.
pub async fn ota_extract(artifact: &Path, output_dir: &Path) -> Result<ToolOutput, ToolError> {
    run_tool(
        "ipsw",
        [
            "ota".as_ref(),
            "extract".as_ref(),
            artifact.as_os_str(),
            "dyld_shared_cache".as_ref(),
            "-o".as_ref(),
            output_dir.as_os_str(),
        ],
        None,
        None,
    )
    .await
}

/// Run `ipsw extract -d` on a restore image, optionally for one
/// architecture, under the hard extract timeout.
pub async fn extract_dsc(
    ipsw_path: &Path,
    output_dir: &Path,
    arch: Option<Arch>,
) -> Result<(), ToolError> {
    let mut args: Vec<&std::ffi::OsStr> = vec![
        "extract".as_ref(),
        ipsw_path.as_os_str(),
        "-d".as_ref(),
        "-o".as_ref(),
        output_dir.as_os_str(),
    ];
    let arch_str = arch.map(Arch::as_str);
    if let Some(arch_str) = arch_str {
        args.push("-a".as_ref());
        args.push(arch_str.as_ref());
    }

    run_tool("ipsw", args, None, Some(EXTRACT_TIMEOUT))
        .await?
        .require_success("ipsw extract")?;
    Ok(())
}

/// Split a DSC into per-image files.
pub async fn dyld_split(dsc: &Path, output_dir: &Path) -> Result<(), ToolError> {
    run_tool(
        "ipsw",
        [
            "dyld".as_ref(),
            "split".as_ref(),
            dsc.as_os_str(),
            "--output".as_ref(),
            output_dir.as_os_str(),
        ],
        None,
        None,
    )
    .await?
    .require_success("ipsw dyld split")?;
    Ok(())
}

/// Parse the mount point out of one `ipsw mount sys` output line.
pub fn parse_mount_line(line: &str) -> Option<PathBuf> {
    mount_line_re()
        .captures(line)
        .map(|captures| PathBuf::from(captures[1].trim()))
}

/// A mounted IPSW system volume.
///
/// `ipsw mount sys` keeps running until interrupted; the volume stays
/// mounted for exactly as long as the child lives.
#[derive(Debug)]
pub struct MountedSystem {
    child: tokio::process::Child,
    /// Where the system volume is mounted.
    pub mount_point: PathBuf,
}

impl MountedSystem {
    /// SIGINT the mounter so it detaches the volume, then reap it.
    #[allow(unsafe_code)]
    pub async fn unmount(mut self) -> Result<(), ToolError> {
        if let Some(pid) = self.child.id() {
            // SAFETY: `pid` comes from a live `Child` we still own and have
            // not waited on, so it cannot have been recycled. kill(2) with
            // SIGINT only delivers a signal; it touches no memory of ours.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGINT);
            }
        }
        let _ = self.child.wait().await;
        Ok(())
    }
}

/// Mount the system volume of a restore image.
///
/// Waits for the `Mounted sys DMG <path>` stderr line; anything else
/// (password prompt, failure) runs into the mount timeout.
pub async fn mount_system(ipsw_path: &Path) -> Result<MountedSystem, ToolError> {
    let mut child = tokio::process::Command::new("ipsw")
        .arg("mount")
        .arg("sys")
        .arg(ipsw_path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ToolError::Spawn {
            tool: "ipsw mount".to_string(),
            source,
        })?;

    let stderr = child.stderr.take().ok_or_else(|| ToolError::Parse {
        tool: "ipsw mount".to_string(),
        message: "stderr not captured".to_string(),
    })?;

    let wait_for_mount = async {
        let mut lines = BufReader::new(stderr).lines();
        while let Some(line) = lines.next_line().await? {
            if let Some(mount_point) = parse_mount_line(&line) {
                return Ok(mount_point);
            }
        }
        Err(ToolError::Parse {
            tool: "ipsw mount".to_string(),
            message: "mounter exited without reporting a mount point".to_string(),
        })
    };

    let mount_point = match tokio::time::timeout(MOUNT_TIMEOUT, wait_for_mount).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(ToolError::Timeout {
                tool: "ipsw mount".to_string(),
                timeout: MOUNT_TIMEOUT,
            })
        }
    };

    Ok(MountedSystem { child, mount_point })
}
