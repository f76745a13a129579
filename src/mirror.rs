use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::util;

/// Recreate the directory skeleton of `source` under `destination` (mkdir -p
/// semantics). Existing directories are left alone, so repeated calls are
/// harmless. Returns the number of directories created.
///
/// A directory that cannot be created is logged and skipped; later writes into
/// it will surface as per-file failures.
pub fn mirror_directories(source: &Path, destination: &Path) -> Result<usize> {
    util::require_path(source)?;
    std::fs::create_dir_all(destination)
        .with_context(|| format!("Failed to create directory: {}", destination.display()))?;

    let mut created = 0;
    for entry in WalkDir::new(source).min_depth(1).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry under {}: {}", source.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(source)
            .with_context(|| "Failed to compute relative path")?;
        let target = destination.join(relative);
        if target.is_dir() {
            continue;
        }
        match std::fs::create_dir_all(&target) {
            Ok(()) => {
                debug!("Created directory: {}", target.display());
                created += 1;
            }
            Err(e) => warn!("Failed to create directory {}: {}", target.display(), e),
        }
    }

    Ok(created)
}
