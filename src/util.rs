use anyhow::{Context, Result};
use memmap2::Mmap;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::PatchError;
use crate::patch_format::{FileIdentity, TreeSnapshot};

/// Fail with [`PatchError::PathNotFound`] unless `path` exists.
pub fn require_path(path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(PatchError::PathNotFound(path.to_path_buf()).into())
    }
}

/// Walk a directory tree and record every regular file as a [`FileIdentity`].
///
/// Symlinks are never followed (so cycles are impossible) and are skipped with a
/// warning, as are sockets, fifos and device nodes. An unreadable directory is
/// reported and its subtree left out; the walk itself keeps going. Entries come
/// out depth-first, sorted by file name within each directory.
pub fn walk_tree(root: &Path) -> Result<TreeSnapshot> {
    require_path(root)?;

    let mut snapshot = TreeSnapshot::default();

    for entry in WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                continue;
            }
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        if !file_type.is_file() {
            warn!("Skipping non-regular file: {}", entry.path().display());
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .with_context(|| "Failed to compute relative path")?;

        let dir_components: Option<Vec<&str>> = relative
            .parent()
            .map(|p| p.components().map(|c| c.as_os_str().to_str()).collect())
            .unwrap_or(Some(Vec::new()));
        let (Some(name), Some(dir_components)) = (entry.file_name().to_str(), dir_components) else {
            warn!("Skipping non-UTF8 path: {}", relative.display());
            continue;
        };
        let dir = dir_components.join("/");

        let size = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!("Skipping {}: cannot read metadata: {}", entry.path().display(), e);
                continue;
            }
        };

        snapshot.entries.push(FileIdentity::new(name, &dir));
        snapshot.total_size += size;
    }

    debug!(
        "Walked {}: {} files, {} bytes",
        root.display(),
        snapshot.len(),
        snapshot.total_size
    );
    Ok(snapshot)
}

/// Total byte size of all regular files under `root`.
pub fn tree_size(root: &Path) -> Result<u64> {
    Ok(walk_tree(root)?.total_size)
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;
    // SAFETY: We only read from this mapping; the single-writer assumption covers the trees.
    unsafe {
        Mmap::map(&file)
            .with_context(|| format!("Failed to memory-map file: {}", path.display()))
    }
}

/// Compute the BLAKE3 hash of a byte slice.
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Move `from` to `to`, falling back to copy-and-remove when a rename is not
/// possible (e.g. across filesystems).
pub fn move_file(from: &Path, to: &Path) -> Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to)
        .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()))?;
    std::fs::remove_file(from)
        .with_context(|| format!("Failed to remove {} after copy", from.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_records_name_and_relative_dir() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("sub/deeper")).unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::write(root.join("a.txt"), b"abc").unwrap();
        fs::write(root.join("sub/b.txt"), b"hello").unwrap();
        fs::write(root.join("sub/deeper/c.bin"), [0u8; 10]).unwrap();

        let snapshot = walk_tree(root).unwrap();
        assert_eq!(
            snapshot.entries,
            vec![
                FileIdentity::new("a.txt", ""),
                FileIdentity::new("b.txt", "sub"),
                FileIdentity::new("c.bin", "sub/deeper"),
            ]
        );
        assert_eq!(snapshot.total_size, 18);
    }

    #[cfg(unix)]
    #[test]
    fn test_walk_keeps_backslash_dir_distinct() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("w\\x")).unwrap();
        fs::create_dir_all(root.join("w/x")).unwrap();
        fs::write(root.join("w\\x/f.txt"), b"1").unwrap();
        fs::write(root.join("w/x/f.txt"), b"2").unwrap();

        let snapshot = walk_tree(root).unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.entries.contains(&FileIdentity::new("f.txt", "w\\x")));
        assert!(snapshot.entries.contains(&FileIdentity::new("f.txt", "w/x")));
        for id in &snapshot.entries {
            assert!(id.resolve(root).is_file(), "{} does not resolve", id);
        }
    }

    #[test]
    fn test_walk_missing_root() {
        let tmp = TempDir::new().unwrap();
        let err = walk_tree(&tmp.path().join("missing")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PatchError>(),
            Some(PatchError::PathNotFound(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_walk_skips_symlinks() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("dir")).unwrap();
        fs::write(root.join("dir/real.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(root.join("dir/real.txt"), root.join("link.txt")).unwrap();
        // A cycle back to the root must not loop.
        std::os::unix::fs::symlink(root, root.join("dir/loop")).unwrap();

        let snapshot = walk_tree(root).unwrap();
        assert_eq!(snapshot.entries, vec![FileIdentity::new("real.txt", "dir")]);
    }

    #[test]
    fn test_tree_size_counts_files_only() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("a/b")).unwrap();
        fs::write(tmp.path().join("a/b/f"), vec![1u8; 100]).unwrap();
        fs::write(tmp.path().join("g"), vec![1u8; 23]).unwrap();
        assert_eq!(tree_size(tmp.path()).unwrap(), 123);
    }

    #[test]
    fn test_move_file() {
        let tmp = TempDir::new().unwrap();
        let from = tmp.path().join("from.txt");
        let to = tmp.path().join("to.txt");
        fs::write(&from, b"payload").unwrap();
        move_file(&from, &to).unwrap();
        assert!(!from.exists());
        assert_eq!(fs::read(&to).unwrap(), b"payload");
    }
}
