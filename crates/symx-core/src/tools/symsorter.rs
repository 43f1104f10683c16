//! Invocation of the external `symsorter` binary.

use std::path::Path;

use super::{run_tool, ToolError};

/// Arrange split DSC output (or a whole mounted volume) into the
/// debug-id-addressed symbol tree under `output_dir`.
///
/// `prefix` is the lower-cased platform; `bundle_id` names the per-bundle
/// index this run's symbols are recorded under. `ignore_errors` is used
/// for whole-volume runs where unparsable binaries are expected.
pub async fn symsort(
    input_dir: &Path,
    output_dir: &Path,
    prefix: &str,
    bundle_id: &str,
    ignore_errors: bool,
) -> Result<(), ToolError> {
    tracing::info!(
        input = %input_dir.display(),
        output = %output_dir.display(),
        bundle_id,
        "symsorting"
    );

    let mut args: Vec<&std::ffi::OsStr> = vec![
        "-zz".as_ref(),
        "-o".as_ref(),
        output_dir.as_os_str(),
        "--prefix".as_ref(),
        prefix.as_ref(),
        "--bundle-id".as_ref(),
        bundle_id.as_ref(),
    ];
    if ignore_errors {
        args.push("--ignore-errors".as_ref());
    }
    args.push(input_dir.as_os_str());

    run_tool("symsorter", args, None, None)
        .await?
        .require_success("symsorter")?;
    Ok(())
}
