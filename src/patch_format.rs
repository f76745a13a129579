use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const FORMAT_VERSION: u32 = 1;

/// Artifact tree layout.
pub const HEADER_FILE: &str = "patch.json";
pub const NEW_FILES_LIST: &str = "new_files.txt";
pub const MODIFIED_FILES_LIST: &str = "modified_files.txt";
pub const DELETED_FILES_LIST: &str = "deleted_files.txt";
pub const PAYLOAD_DIR: &str = "files";

/// A file's identity across two trees: its name plus the directory it lives in,
/// relative to the tree root.
///
/// `relative_dir` is canonical: forward slashes, no leading or trailing slash,
/// empty for the root. Only [`FileIdentity::new`] builds one, so two identities
/// compare equal exactly when they name the same place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileIdentity {
    pub name: String,
    pub relative_dir: String,
}

impl FileIdentity {
    pub fn new(name: impl Into<String>, relative_dir: &str) -> Self {
        Self {
            name: name.into(),
            relative_dir: canonical_dir(relative_dir),
        }
    }

    /// `dir/name`, or just `name` at the root.
    pub fn relative_path(&self) -> String {
        if self.relative_dir.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.relative_dir, self.name)
        }
    }

    /// Resolve this identity under `root` using the platform separator.
    pub fn resolve(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for component in self.relative_dir.split('/').filter(|c| !c.is_empty()) {
            path.push(component);
        }
        path.push(&self.name);
        path
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.relative_path())
    }
}

/// Split on the platform's separators only: `\` is an ordinary name character
/// on Unix.
fn canonical_dir(dir: &str) -> String {
    dir.split(|c: char| c == '/' || std::path::is_separator(c))
        .filter(|c| !c.is_empty() && *c != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Regular files found under one root, in walk order.
#[derive(Debug, Clone, Default)]
pub struct TreeSnapshot {
    pub entries: Vec<FileIdentity>,
    /// Sum of the sizes of every entry, in bytes.
    pub total_size: u64,
}

impl TreeSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub new_files: Vec<FileIdentity>,
    pub modified_files: Vec<FileIdentity>,
    pub deleted_files: Vec<FileIdentity>,
}

impl ChangeSet {
    /// Move entries whose delta could not be produced into `new_files`, so they
    /// travel as full copies instead.
    pub fn reclassify_as_new(&mut self, failed: &[FileIdentity]) {
        if failed.is_empty() {
            return;
        }
        let failed: std::collections::HashSet<&FileIdentity> = failed.iter().collect();
        let (moved, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.modified_files)
            .into_iter()
            .partition(|id| failed.contains(id));
        self.modified_files = kept;
        self.new_files.extend(moved);
    }

    pub fn total(&self) -> usize {
        self.new_files.len() + self.modified_files.len() + self.deleted_files.len()
    }
}

/// Contents of `patch.json` at the artifact root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchHeader {
    pub format_version: u32,
    pub tool: String,
    /// Total byte size of the modified tree, used for the post-replay check.
    pub expected_size: u64,
    pub expected_files: usize,
}

/// The decoded artifact tree manifest: what to do, and where the payload is.
#[derive(Debug, Clone)]
pub struct PatchManifest {
    pub header: PatchHeader,
    pub changes: ChangeSet,
    pub payload_root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Copy,
    Delete,
    Insert,
    Patch,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Copy => "copy",
            Stage::Delete => "delete",
            Stage::Insert => "insert",
            Stage::Patch => "patch",
        };
        f.write_str(s)
    }
}

/// One isolated per-file failure. The run keeps going.
#[derive(Debug, Clone)]
pub struct FileFailure {
    pub path: String,
    pub stage: Stage,
    pub reason: String,
}

impl FileFailure {
    pub fn new(path: impl Into<String>, stage: Stage, err: &anyhow::Error) -> Self {
        Self {
            path: path.into(),
            stage,
            reason: format!("{:#}", err),
        }
    }
}

pub struct CreateSummary {
    pub dirs_mirrored: usize,
    pub files_added: usize,
    pub files_modified: usize,
    pub files_deleted: usize,
    /// Modified files whose delta failed and were shipped in full instead.
    pub reclassified: Vec<FileIdentity>,
    pub failures: Vec<FileFailure>,
    pub expected_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verification {
    pub expected_size: u64,
    pub actual_size: u64,
}

impl Verification {
    pub fn matches(&self) -> bool {
        self.expected_size == self.actual_size
    }
}

pub struct ReplaySummary {
    pub files_deleted: usize,
    pub files_added: usize,
    pub files_modified: usize,
    pub dirs_pruned: usize,
    pub failures: Vec<FileFailure>,
    pub verification: Verification,
}

impl ReplaySummary {
    pub fn applied(&self) -> usize {
        self.files_deleted + self.files_added + self.files_modified
    }
}
