//! Tool resolution for `set-up-tool` steps

use crate::runtime::RunnerError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Locate a tool executable on the given search path.
///
/// Tries `<tool><version>` (e.g. `python3.8`) first, then the bare `<tool>`.
pub fn resolve(
    tool: &str,
    version: Option<&str>,
    search_path: &str,
    cwd: &Path,
) -> Result<PathBuf, RunnerError> {
    let mut candidates = Vec::with_capacity(2);
    if let Some(version) = version.filter(|v| !v.is_empty()) {
        candidates.push(format!("{}{}", tool, version));
    }
    candidates.push(tool.to_string());

    for candidate in &candidates {
        if let Ok(found) = which::which_in(candidate, Some(search_path), cwd) {
            debug!("Resolved tool {} to {}", candidate, found.display());
            return Ok(found);
        }
    }

    Err(RunnerError::ToolNotFound(candidates.join(" or ")))
}

/// Prepend a directory to a `PATH`-style value
pub fn prepend_path(dir: &Path, path: &str) -> String {
    let mut entries = vec![dir.to_path_buf()];
    entries.extend(std::env::split_paths(path).filter(|p| p != dir));
    std::env::join_paths(entries)
        .map(|joined| joined.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string())
}
