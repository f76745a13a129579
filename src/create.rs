use anyhow::{Context, Result};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::classify::classify;
use crate::config::PatchConfig;
use crate::error::PatchError;
use crate::manifest;
use crate::mirror;
use crate::patch_format::{
    CreateSummary, FileFailure, FileIdentity, PatchHeader, Stage, FORMAT_VERSION, PAYLOAD_DIR,
};
use crate::tool::DeltaTool;
use crate::util;

/// Run the delta tool for every modified file, writing each artifact at the
/// file's mirrored location under `payload`. Returns the files whose delta
/// failed; any partial artifact they left behind is removed.
///
/// The payload skeleton must already exist (see [`mirror::mirror_directories`]).
pub fn produce_patches(
    tool: &dyn DeltaTool,
    modified_files: &[FileIdentity],
    origin_root: &Path,
    modified_root: &Path,
    payload: &Path,
) -> Vec<FileIdentity> {
    modified_files
        .par_iter()
        .filter_map(|id| {
            let old = id.resolve(origin_root);
            let new = id.resolve(modified_root);
            let artifact = id.resolve(payload);
            debug!("Creating delta for {}", id);
            match tool.diff(&old, &new, &artifact) {
                Ok(()) => None,
                Err(e) => {
                    warn!("Delta for {} failed, shipping it in full: {:#}", id, e);
                    discard_partial_artifact(&artifact);
                    Some(id.clone())
                }
            }
        })
        .collect()
}

fn discard_partial_artifact(artifact: &Path) {
    match std::fs::remove_file(artifact) {
        Ok(()) => debug!("Removed partial delta {}", artifact.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial delta {}: {}", artifact.display(), e),
    }
}

/// Copy every new file from the modified tree into the payload.
fn copy_new_files(
    new_files: &[FileIdentity],
    modified_root: &Path,
    payload: &Path,
) -> Vec<(FileIdentity, FileFailure)> {
    new_files
        .par_iter()
        .filter_map(|id| {
            let from = id.resolve(modified_root);
            let to = id.resolve(payload);
            let copied = std::fs::copy(&from, &to)
                .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()));
            match copied {
                Ok(_) => None,
                Err(e) => {
                    warn!("Copy of {} failed: {:#}", id, e);
                    let failure = FileFailure::new(id.relative_path(), Stage::Copy, &e);
                    Some((id.clone(), failure))
                }
            }
        })
        .collect()
}

/// The artifact directory must be absent or empty, so stale payload from an
/// earlier run can never leak into this one.
fn prepare_artifact_dir(artifact_root: &Path) -> Result<()> {
    if artifact_root.exists() {
        let mut entries = std::fs::read_dir(artifact_root)
            .with_context(|| format!("Failed to read directory: {}", artifact_root.display()))?;
        if entries.next().is_some() {
            return Err(PatchError::ArtifactDirNotEmpty(artifact_root.to_path_buf()).into());
        }
    }
    std::fs::create_dir_all(artifact_root)
        .with_context(|| format!("Failed to create directory: {}", artifact_root.display()))
}

/// Compare `origin` and `modified` and write the artifact tree to `artifact_root`.
pub async fn create_patch(
    origin: &Path,
    modified: &Path,
    artifact_root: &Path,
    config: &PatchConfig,
) -> Result<CreateSummary> {
    let tool = config.build_tool(config.tool);
    create_patch_with(origin, modified, artifact_root, tool, config).await
}

pub async fn create_patch_with(
    origin: &Path,
    modified: &Path,
    artifact_root: &Path,
    tool: Arc<dyn DeltaTool>,
    config: &PatchConfig,
) -> Result<CreateSummary> {
    util::require_path(origin)?;
    util::require_path(modified)?;
    prepare_artifact_dir(artifact_root)?;
    let pool = config.thread_pool()?;

    // Stage 1: walk both trees concurrently
    let origin_owned = origin.to_path_buf();
    let modified_owned = modified.to_path_buf();
    let (origin_snapshot, modified_snapshot) = tokio::try_join!(
        tokio::task::spawn_blocking(move || util::walk_tree(&origin_owned)),
        tokio::task::spawn_blocking(move || util::walk_tree(&modified_owned)),
    )?;
    let origin_snapshot = origin_snapshot?;
    let modified_snapshot = modified_snapshot?;
    info!(
        "Origin has {} files, modified has {} files",
        origin_snapshot.len(),
        modified_snapshot.len()
    );

    // Stage 2: classify, and refuse early if the manifest cannot carry a name
    let changes = classify(&origin_snapshot, &modified_snapshot);
    manifest::validate(&changes)?;
    info!(
        "Classified: {} new, {} modified, {} deleted",
        changes.new_files.len(),
        changes.modified_files.len(),
        changes.deleted_files.len()
    );

    // Stage 3: payload skeleton before any file lands in it
    let payload = artifact_root.join(PAYLOAD_DIR);
    let dirs_mirrored = mirror::mirror_directories(modified, &payload)?;

    // Stage 4: deltas, then full copies for new files and failed deltas
    let tool_name = tool.name().to_string();
    let origin_root: PathBuf = origin.to_path_buf();
    let modified_root: PathBuf = modified.to_path_buf();
    let (changes, reclassified, failures) = tokio::task::spawn_blocking(move || {
        pool.install(|| {
            let mut changes = changes;
            let failed = produce_patches(
                tool.as_ref(),
                &changes.modified_files,
                &origin_root,
                &modified_root,
                &payload,
            );
            changes.reclassify_as_new(&failed);

            let copy_failures = copy_new_files(&changes.new_files, &modified_root, &payload);
            if !copy_failures.is_empty() {
                let dropped: std::collections::HashSet<&FileIdentity> =
                    copy_failures.iter().map(|(id, _)| id).collect();
                changes.new_files.retain(|id| !dropped.contains(id));
            }
            let failures = copy_failures.into_iter().map(|(_, f)| f).collect::<Vec<_>>();
            (changes, failed, failures)
        })
    })
    .await?;

    // Stage 5: listings and header
    let header = PatchHeader {
        format_version: FORMAT_VERSION,
        tool: tool_name,
        expected_size: modified_snapshot.total_size,
        expected_files: modified_snapshot.len(),
    };
    manifest::write_manifest(artifact_root, &header, &changes)?;

    Ok(CreateSummary {
        dirs_mirrored,
        files_added: changes.new_files.len(),
        files_modified: changes.modified_files.len(),
        files_deleted: changes.deleted_files.len(),
        reclassified,
        failures,
        expected_size: header.expected_size,
    })
}
