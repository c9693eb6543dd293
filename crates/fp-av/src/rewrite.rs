//! FLV metadata rewriting after a finished transcode.
//!
//! Uses `flvmeta -U <file>`, or `flvtool2 -U <file>` when only flvtool2 is
//! installed. Both update the file in place.

use crate::process::ToolCommand;
use crate::tools::{Tool, ToolLocator};

/// Name of the rewriter binary that will actually run.
fn rewriter_name(locator: &ToolLocator) -> String {
    locator
        .resolve(Tool::Flvmeta)
        .ok()
        .and_then(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| Tool::Flvmeta.name().to_string())
}

/// Rewrite the metadata of one file.
///
/// # Errors
///
/// [`fp_core::Error::PostProcess`] describing why the rewriter failed.
pub async fn rewrite_file(locator: &ToolLocator, target: &str) -> fp_core::Result<()> {
    tracing::debug!("Rewriting FLV metadata of {target}");
    ToolCommand::new(Tool::Flvmeta)
        .args(["-U", target])
        .execute(locator)
        .await
        .map(|_| ())
        .map_err(|e| fp_core::Error::post_process(rewriter_name(locator), format!("{target}: {e}")))
}

/// Rewrite every target in order. All rewrites run even after a failure;
/// the first failure is returned.
pub async fn rewrite_all(locator: &ToolLocator, targets: &[String]) -> fp_core::Result<()> {
    let mut first_error = None;

    for target in targets {
        if let Err(e) = rewrite_file(locator, target).await {
            tracing::warn!("{e}");
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
