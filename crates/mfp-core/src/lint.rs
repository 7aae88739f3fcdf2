//! Lint pass over Python sources.
//!
//! Both pipelines go through here: the compiler lints each generated library
//! before writing it, and the executor lints prelude + snippet before the
//! container starts. The linter is an external command (`ruff` by default),
//! invoked synchronously over a temp file.

use std::process::Command;

use mfp_types::MfpError;

/// Whether the configured linter can run at all. An empty binary name
/// disables the pass explicitly.
pub fn lint_available(lint_bin: &str) -> bool {
    !lint_bin.is_empty() && which::which(lint_bin).is_ok()
}

/// Lint one Python source. Returns [`MfpError::Lint`] with the linter's
/// output attached when the check fails.
pub fn lint_source(lint_bin: &str, file_name: &str, content: &str) -> Result<(), MfpError> {
    let dir = tempfile::tempdir()
        .map_err(|e| MfpError::Internal(format!("failed to create lint scratch dir: {e}")))?;
    let path = dir.path().join(file_name);
    std::fs::write(&path, content)
        .map_err(|e| MfpError::Internal(format!("failed to stage lint input: {e}")))?;

    let output = Command::new(lint_bin)
        .arg("check")
        .arg("--quiet")
        .arg(&path)
        .output()
        .map_err(|e| MfpError::Internal(format!("failed to run linter {lint_bin}: {e}")))?;

    if output.status.success() {
        return Ok(());
    }

    let mut report = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !report.is_empty() {
            report.push('\n');
        }
        report.push_str(stderr.trim_end());
    }
    // Keep the operator message free of scratch paths.
    let report = report.replace(&*dir.path().to_string_lossy(), "");
    Err(MfpError::Lint { output: report })
}
