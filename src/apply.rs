use anyhow::{Context, Result};
use rayon::prelude::*;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::PatchConfig;
use crate::manifest;
use crate::mirror;
use crate::patch_format::{
    FileFailure, FileIdentity, PatchManifest, ReplaySummary, Stage, Verification,
};
use crate::tool::{DeltaTool, ToolKind};
use crate::util;

/// Outcome of one replay phase: how many entries went through, and the rest.
struct PhaseResult {
    done: usize,
    failures: Vec<FileFailure>,
}

fn run_phase<F>(entries: &[FileIdentity], stage: Stage, op: F) -> PhaseResult
where
    F: Fn(&FileIdentity) -> Result<()> + Sync,
{
    let failures: Vec<FileFailure> = entries
        .par_iter()
        .filter_map(|id| match op(id) {
            Ok(()) => None,
            Err(e) => {
                warn!("{} failed for {}: {:#}", stage, id, e);
                Some(FileFailure::new(id.relative_path(), stage, &e))
            }
        })
        .collect();
    PhaseResult {
        done: entries.len() - failures.len(),
        failures,
    }
}

/// Remove a deleted file. Already gone counts as done.
fn delete_file(target: &Path, id: &FileIdentity) -> Result<()> {
    let full = id.resolve(target);
    match std::fs::remove_file(&full) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("Already absent: {}", full.display());
            Ok(())
        }
        Err(e) => Err(anyhow::Error::from(e))
            .with_context(|| format!("Failed to delete file: {}", full.display())),
    }
}

/// Move a new file out of the payload into the target, creating its parent and
/// clearing an empty directory that occupies its path.
fn insert_file(payload: &Path, target: &Path, id: &FileIdentity) -> Result<()> {
    let from = id.resolve(payload);
    let to = id.resolve(target);
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    if to.is_dir() {
        std::fs::remove_dir(&to)
            .with_context(|| format!("Directory in the way of new file: {}", to.display()))?;
    }
    util::move_file(&from, &to)
}

/// Patch a modified file through a sibling temp file, replacing the original
/// only once the tool has succeeded.
fn patch_in_place(tool: &dyn DeltaTool, payload: &Path, target: &Path, id: &FileIdentity) -> Result<()> {
    let file = id.resolve(target);
    let artifact = id.resolve(payload);
    let parent = file
        .parent()
        .with_context(|| format!("No parent directory: {}", file.display()))?;
    let permissions = std::fs::metadata(&file)
        .with_context(|| format!("Failed to read metadata: {}", file.display()))?
        .permissions();

    let temp = tempfile::Builder::new()
        .prefix(".treepatch-")
        .tempfile_in(parent)
        .with_context(|| format!("Failed to create temp file in {}", parent.display()))?
        .into_temp_path();

    tool.patch(&file, &temp, &artifact)?;

    std::fs::set_permissions(&temp, permissions)
        .with_context(|| format!("Failed to set permissions on {}", temp.display()))?;
    temp.persist(&file)
        .with_context(|| format!("Failed to replace {}", file.display()))?;
    Ok(())
}

/// An unreadable directory counts as non-empty and is left in place.
fn is_empty_dir(path: &Path) -> bool {
    match std::fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(e) => {
            warn!("Skipping unreadable directory {}: {}", path.display(), e);
            false
        }
    }
}

/// Remove every empty directory under `root` (never `root` itself), repeating
/// until a full pass removes nothing. Returns the number removed.
pub fn prune_empty_dirs(root: &Path) -> Result<usize> {
    let mut removed = 0;
    loop {
        let mut removed_this_pass = 0;
        // Deepest first, so a parent emptied by its children goes in the same pass.
        for entry in walkdir::WalkDir::new(root)
            .min_depth(1)
            .contents_first(true)
            .follow_links(false)
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            let path = entry.path();
            if !is_empty_dir(path) {
                continue;
            }
            match std::fs::remove_dir(path) {
                Ok(()) => {
                    debug!("Removed empty directory: {}", path.display());
                    removed_this_pass += 1;
                }
                Err(e) => warn!("Failed to remove empty directory {}: {}", path.display(), e),
            }
        }
        removed += removed_this_pass;
        if removed_this_pass == 0 {
            return Ok(removed);
        }
    }
}

/// Where the expected tree size comes from for the final check.
pub enum Expected<'a> {
    /// Use the size recorded in the patch header.
    Header,
    /// Measure a local copy of the modified tree.
    Tree(&'a Path),
}

/// Apply the artifact tree at `artifact_root` to `target`.
///
/// Uses `tool_override` when given, otherwise the tool named in the patch header.
pub async fn apply_patch(
    target: &Path,
    artifact_root: &Path,
    expected: Expected<'_>,
    tool_override: Option<ToolKind>,
    config: &PatchConfig,
) -> Result<ReplaySummary> {
    util::require_path(target)?;
    util::require_path(artifact_root)?;
    let manifest = manifest::read_manifest(artifact_root)?;
    let kind = match tool_override {
        Some(kind) => kind,
        None => manifest.header.tool.parse()?,
    };
    let tool = config.build_tool(kind);
    apply_manifest(target, manifest, expected, tool, config).await
}

/// Replay an already-decoded manifest: delete, mirror, insert, patch, prune,
/// then compare tree sizes. Each phase finishes before the next starts.
pub async fn apply_manifest(
    target: &Path,
    manifest: PatchManifest,
    expected: Expected<'_>,
    tool: Arc<dyn DeltaTool>,
    config: &PatchConfig,
) -> Result<ReplaySummary> {
    util::require_path(target)?;
    let expected_size = match expected {
        Expected::Header => manifest.header.expected_size,
        Expected::Tree(path) => util::tree_size(path)?,
    };
    let pool = config.thread_pool()?;
    let target_owned = target.to_path_buf();

    let summary = tokio::task::spawn_blocking(move || -> Result<ReplaySummary> {
        let target = target_owned.as_path();
        let payload = manifest.payload_root.as_path();
        let changes = &manifest.changes;

        pool.install(|| -> Result<ReplaySummary> {
            // 1. Deletions
            let deleted = run_phase(&changes.deleted_files, Stage::Delete, |id| {
                delete_file(target, id)
            });
            info!("Deleted {} files", deleted.done);

            // Skeleton after deletions, so a file replaced by a directory is gone first.
            if payload.exists() {
                mirror::mirror_directories(payload, target)?;
            }

            // 2. New files
            let added = run_phase(&changes.new_files, Stage::Insert, |id| {
                insert_file(payload, target, id)
            });
            info!("Added {} files", added.done);

            // 3. In-place patches
            let patched = run_phase(&changes.modified_files, Stage::Patch, |id| {
                patch_in_place(tool.as_ref(), payload, target, id)
            });
            info!("Patched {} files", patched.done);

            // 4. Pruning, once every writer above is done
            let dirs_pruned = prune_empty_dirs(target)?;
            info!("Pruned {} empty directories", dirs_pruned);

            let actual_size = util::tree_size(target)?;
            let verification = Verification {
                expected_size,
                actual_size,
            };
            if !verification.matches() {
                warn!(
                    "Integrity check failed: target is {} bytes, expected {}",
                    actual_size, expected_size
                );
            }

            let mut failures = deleted.failures;
            failures.extend(added.failures);
            failures.extend(patched.failures);

            Ok(ReplaySummary {
                files_deleted: deleted.done,
                files_added: added.done,
                files_modified: patched.done,
                dirs_pruned,
                failures,
                verification,
            })
        })
    })
    .await??;

    Ok(summary)
}
