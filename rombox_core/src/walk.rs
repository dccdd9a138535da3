//! Filesystem walking for batch inputs and DAT directories.

use crate::error::Result;
use std::path::{Path, PathBuf};
use tracing::warn;

fn walker(root: &Path) -> ignore::Walk {
    ignore::WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .ignore(false)
        .parents(false)
        .build()
}

/// Every regular file under `root`, sorted.
pub fn files_under(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in walker(root) {
        let entry = entry?;
        if entry.file_type().is_some_and(|t| t.is_file()) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Replace each directory in `paths` with the files beneath it.
///
/// Other paths are kept as given, so a missing file still fails on its own when
/// it is processed. Unreadable entries inside a directory are logged and skipped.
pub fn expand_inputs(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut expanded = Vec::new();
    for path in paths {
        if !path.is_dir() {
            expanded.push(path.clone());
            continue;
        }
        let mut files = Vec::new();
        for entry in walker(path) {
            match entry {
                Ok(entry) if entry.file_type().is_some_and(|t| t.is_file()) => {
                    files.push(entry.into_path());
                }
                Ok(_) => {}
                Err(e) => warn!(root = %path.display(), error = %e, "skipping unreadable entry"),
            }
        }
        files.sort();
        expanded.extend(files);
    }
    expanded
}
