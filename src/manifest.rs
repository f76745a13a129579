//! Line-oriented manifest codec.
//!
//! Each listing holds one `<name> | <relative_dir>` record per line; a root-level
//! file has an empty directory field. The delimiter has no escape, so any name
//! or directory containing it (or a line break) is rejected at encode time.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;

use crate::error::PatchError;
use crate::patch_format::{
    ChangeSet, FileIdentity, PatchHeader, PatchManifest, DELETED_FILES_LIST, FORMAT_VERSION,
    HEADER_FILE, MODIFIED_FILES_LIST, NEW_FILES_LIST, PAYLOAD_DIR,
};

pub const DELIMITER: &str = " | ";

fn check_encodable(id: &FileIdentity) -> Result<()> {
    let bad = |s: &str| s.contains(DELIMITER) || s.contains('\n') || s.contains('\r');
    // A name ending in " |" would run into the delimiter and split early.
    if bad(&id.name) || id.name.ends_with(" |") || bad(&id.relative_dir) {
        return Err(PatchError::DelimiterCollision {
            identity: id.relative_path(),
        }
        .into());
    }
    Ok(())
}

/// Reject any identity the line format cannot carry.
pub fn validate(changes: &ChangeSet) -> Result<()> {
    changes
        .new_files
        .iter()
        .chain(&changes.modified_files)
        .chain(&changes.deleted_files)
        .try_for_each(check_encodable)
}

pub fn encode_line(id: &FileIdentity) -> Result<String> {
    check_encodable(id)?;
    Ok(format!("{}{}{}", id.name, DELIMITER, id.relative_dir))
}

/// Parse one record. `None` means the line has no delimiter.
pub fn decode_line(line: &str) -> Option<FileIdentity> {
    let (name, dir) = match line.split_once(DELIMITER) {
        Some(parts) => parts,
        // Trailing whitespace stripped from a root-level record.
        None => (line.strip_suffix(" |")?, ""),
    };
    if name.is_empty() {
        return None;
    }
    Some(FileIdentity::new(name, dir))
}

fn write_listing(path: &Path, entries: &[FileIdentity]) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create listing: {}", path.display()))?;
    let mut out = std::io::BufWriter::new(file);
    for id in entries {
        writeln!(out, "{}", encode_line(id)?)
            .with_context(|| format!("Failed to write listing: {}", path.display()))?;
    }
    out.flush()
        .with_context(|| format!("Failed to write listing: {}", path.display()))?;
    Ok(())
}

fn read_listing(path: &Path) -> Result<Vec<FileIdentity>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read listing: {}", path.display()))?;
    let mut entries = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let id = decode_line(line).ok_or_else(|| PatchError::MalformedManifest {
            file: path.to_path_buf(),
            line_no: idx + 1,
            line: line.to_string(),
        })?;
        entries.push(id);
    }
    Ok(entries)
}

/// Write the three listings into `dir`. Nothing is written if any identity
/// fails validation.
pub fn write_change_set(changes: &ChangeSet, dir: &Path) -> Result<()> {
    validate(changes)?;
    write_listing(&dir.join(NEW_FILES_LIST), &changes.new_files)?;
    write_listing(&dir.join(MODIFIED_FILES_LIST), &changes.modified_files)?;
    write_listing(&dir.join(DELETED_FILES_LIST), &changes.deleted_files)?;
    Ok(())
}

pub fn read_change_set(dir: &Path) -> Result<ChangeSet> {
    Ok(ChangeSet {
        new_files: read_listing(&dir.join(NEW_FILES_LIST))?,
        modified_files: read_listing(&dir.join(MODIFIED_FILES_LIST))?,
        deleted_files: read_listing(&dir.join(DELETED_FILES_LIST))?,
    })
}

/// Write listings and `patch.json` into the artifact root.
pub fn write_manifest(artifact_root: &Path, header: &PatchHeader, changes: &ChangeSet) -> Result<()> {
    write_change_set(changes, artifact_root)?;
    let header_path = artifact_root.join(HEADER_FILE);
    let json = serde_json::to_vec_pretty(header).context("Failed to serialize patch header")?;
    std::fs::write(&header_path, json)
        .with_context(|| format!("Failed to write header: {}", header_path.display()))?;
    Ok(())
}

pub fn read_manifest(artifact_root: &Path) -> Result<PatchManifest> {
    let header_path = artifact_root.join(HEADER_FILE);
    let raw = std::fs::read(&header_path)
        .with_context(|| format!("Failed to read header: {}", header_path.display()))?;
    let header: PatchHeader = serde_json::from_slice(&raw)
        .with_context(|| format!("Failed to parse header: {}", header_path.display()))?;

    if header.format_version != FORMAT_VERSION {
        return Err(PatchError::UnsupportedFormat {
            found: header.format_version,
            expected: FORMAT_VERSION,
        }
        .into());
    }

    Ok(PatchManifest {
        changes: read_change_set(artifact_root)?,
        payload_root: artifact_root.join(PAYLOAD_DIR),
        header,
    })
}
