use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn treepatch(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_treepatch"))
        .args(args)
        .output()
        .expect("Failed to run treepatch")
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap()
}

fn create_dir_tree(root: &Path, files: &[(&str, &[u8])]) {
    fs::create_dir_all(root).unwrap();
    for (rel_path, content) in files {
        let full = root.join(rel_path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&full, content).unwrap();
    }
}

fn collect_dir_tree(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut entries = Vec::new();
    collect_recursive(root, root, &mut entries);
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

fn collect_recursive(root: &Path, current: &Path, entries: &mut Vec<(String, Vec<u8>)>) {
    let mut dir_entries: Vec<_> = fs::read_dir(current).unwrap().collect::<Result<_, _>>().unwrap();
    dir_entries.sort_by_key(|e| e.file_name());

    for entry in dir_entries {
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap().to_str().unwrap().replace('\\', "/");

        if path.is_dir() {
            entries.push((format!("{}/", rel), Vec::new()));
            collect_recursive(root, &path, entries);
        } else {
            let content = fs::read(&path).unwrap();
            entries.push((rel, content));
        }
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) {
    fs::create_dir_all(dst).unwrap();
    for entry in fs::read_dir(src).unwrap() {
        let entry = entry.unwrap();
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path);
        } else {
            fs::copy(&src_path, &dst_path).unwrap();
        }
    }
}

fn assert_success(output: &Output, what: &str) {
    assert!(
        output.status.success(),
        "{} failed:\nstdout: {}\nstderr: {}",
        what,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

struct Workspace {
    _temp: TempDir,
    origin: std::path::PathBuf,
    modified: std::path::PathBuf,
    target: std::path::PathBuf,
    artifact: std::path::PathBuf,
}

impl Workspace {
    fn new(origin: &[(&str, &[u8])], modified: &[(&str, &[u8])]) -> Self {
        let temp = TempDir::new().unwrap();
        let ws = Self {
            origin: temp.path().join("origin"),
            modified: temp.path().join("modified"),
            target: temp.path().join("target"),
            artifact: temp.path().join("artifact"),
            _temp: temp,
        };
        create_dir_tree(&ws.origin, origin);
        create_dir_tree(&ws.modified, modified);
        copy_dir_recursive(&ws.origin, &ws.target);
        ws
    }

    fn create(&self) -> Output {
        treepatch(&[
            "create",
            "--origin",
            path_str(&self.origin),
            "--modified",
            path_str(&self.modified),
            "--output",
            path_str(&self.artifact),
        ])
    }

    fn apply(&self) -> Output {
        treepatch(&[
            "apply",
            "--target",
            path_str(&self.target),
            "--patch",
            path_str(&self.artifact),
        ])
    }
}

#[test]
fn test_end_to_end_full_patch_cycle() {
    let mut modified_bin = vec![0xAA; 4096];
    modified_bin.extend_from_slice(&vec![0xBB; 4096]);

    let ws = Workspace::new(
        &[
            ("readme.txt", b"Hello, World! This is version 1."),
            ("config/settings.json", b"{\"version\": 1, \"debug\": false}"),
            ("data/records.bin", &vec![0xAA; 8192]),
            ("data/old_file.txt", b"This file will be deleted"),
            ("obsolete/nested/remove_me.txt", b"Going away"),
        ],
        &[
            ("readme.txt", b"Hello, World! This is version 2 with new features."),
            ("config/settings.json", b"{\"version\": 2, \"debug\": true, \"newField\": 42}"),
            ("data/records.bin", &modified_bin),
            ("data/new_file.txt", b"Brand new file in version 2"),
            ("extras/bonus.dat", &vec![0xFF; 1024]),
        ],
    );

    let output = ws.create();
    assert_success(&output, "treepatch create");
    for listing in ["new_files.txt", "modified_files.txt", "deleted_files.txt", "patch.json"] {
        assert!(ws.artifact.join(listing).is_file(), "missing {}", listing);
    }
    let new_listing = fs::read_to_string(ws.artifact.join("new_files.txt")).unwrap();
    assert!(new_listing.lines().any(|l| l == "bonus.dat | extras"));
    let deleted_listing = fs::read_to_string(ws.artifact.join("deleted_files.txt")).unwrap();
    assert!(deleted_listing.lines().any(|l| l == "remove_me.txt | obsolete/nested"));

    let output = ws.apply();
    assert_success(&output, "treepatch apply");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Integrity check: OK"), "stdout: {}", stdout);

    assert_eq!(collect_dir_tree(&ws.modified), collect_dir_tree(&ws.target));
    assert!(!ws.target.join("data/old_file.txt").exists());
    assert!(!ws.target.join("obsolete").exists());
    assert!(ws.target.join("extras/bonus.dat").exists());
}

#[test]
fn test_empty_to_full() {
    let ws = Workspace::new(
        &[],
        &[("file1.txt", b"Content of file 1"), ("sub/file2.txt", b"Content of file 2")],
    );

    assert_success(&ws.create(), "create");
    assert_success(&ws.apply(), "apply");
    assert_eq!(collect_dir_tree(&ws.modified), collect_dir_tree(&ws.target));
}

#[test]
fn test_full_to_empty_prunes_directories() {
    let ws = Workspace::new(&[("a/b/c/deep.txt", b"deep"), ("top.txt", b"top")], &[]);

    assert_success(&ws.create(), "create");
    assert_success(&ws.apply(), "apply");
    assert!(collect_dir_tree(&ws.target).is_empty());
}

#[test]
fn test_no_changes() {
    let files: &[(&str, &[u8])] = &[("a.txt", b"Same content"), ("sub/b.txt", b"Also same")];
    let ws = Workspace::new(files, files);

    assert_success(&ws.create(), "create");
    // Unchanged files still travel as (trivial) deltas.
    let modified_listing = fs::read_to_string(ws.artifact.join("modified_files.txt")).unwrap();
    assert_eq!(modified_listing.lines().count(), 2);

    assert_success(&ws.apply(), "apply");
    assert_eq!(collect_dir_tree(&ws.modified), collect_dir_tree(&ws.target));
}

#[test]
fn test_apply_with_expected_tree_detects_divergence() {
    let ws = Workspace::new(&[("a.txt", b"v1")], &[("a.txt", b"version two")]);
    assert_success(&ws.create(), "create");

    // Someone edits the modified tree after the patch was made.
    fs::write(ws.modified.join("extra.txt"), b"late addition").unwrap();

    let output = treepatch(&[
        "apply",
        "--target",
        path_str(&ws.target),
        "--patch",
        path_str(&ws.artifact),
        "--expected",
        path_str(&ws.modified),
    ]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stdout).contains("Integrity check: FAILED"));
    // Applied changes stay.
    assert_eq!(fs::read(ws.target.join("a.txt")).unwrap(), b"version two");
}

#[test]
fn test_unsupported_tool_is_rejected() {
    let ws = Workspace::new(&[("a.txt", b"1")], &[("a.txt", b"2")]);
    let output = treepatch(&[
        "create",
        "--origin",
        path_str(&ws.origin),
        "--modified",
        path_str(&ws.modified),
        "--output",
        path_str(&ws.artifact),
        "--tool",
        "rsync",
    ]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unsupported delta tool"));
    assert!(!ws.artifact.exists());
}

#[test]
fn test_missing_origin_is_rejected() {
    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join("modified")).unwrap();
    let output = treepatch(&[
        "create",
        "--origin",
        path_str(&temp.path().join("missing")),
        "--modified",
        path_str(&temp.path().join("modified")),
        "--output",
        path_str(&temp.path().join("artifact")),
    ]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("path does not exist"));
}

#[test]
fn test_plan_lists_classification() {
    let ws = Workspace::new(&[("a.txt", b"1"), ("c.txt", b"3")], &[("a.txt", b"1"), ("b.txt", b"2")]);
    let output = treepatch(&[
        "plan",
        "--origin",
        path_str(&ws.origin),
        "--modified",
        path_str(&ws.modified),
    ]);
    assert_success(&output, "plan");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("New (1):\n  b.txt\n"), "stdout: {}", stdout);
    assert!(stdout.contains("Modified (1):\n  a.txt\n"), "stdout: {}", stdout);
    assert!(stdout.contains("Deleted (1):\n  c.txt\n"), "stdout: {}", stdout);
    assert!(!ws.artifact.exists());
}

#[test]
fn test_single_file_round_trip() {
    let temp = TempDir::new().unwrap();
    let old = temp.path().join("old.bin");
    let new = temp.path().join("new.bin");
    let delta = temp.path().join("delta");
    let rebuilt = temp.path().join("rebuilt.bin");

    let old_data: Vec<u8> = (0..50_000u32).map(|i| (i % 241) as u8).collect();
    let mut new_data = old_data.clone();
    new_data.truncate(30_000);
    new_data.extend_from_slice(b"appended");
    fs::write(&old, &old_data).unwrap();
    fs::write(&new, &new_data).unwrap();

    assert_success(
        &treepatch(&["diff-file", "--old", path_str(&old), "--new", path_str(&new), "--output", path_str(&delta)]),
        "diff-file",
    );
    assert_success(
        &treepatch(&["patch-file", "--old", path_str(&old), "--patch", path_str(&delta), "--output", path_str(&rebuilt)]),
        "patch-file",
    );
    assert_eq!(fs::read(&rebuilt).unwrap(), new_data);
}

#[test]
fn test_verify_command() {
    let temp = TempDir::new().unwrap();
    create_dir_tree(&temp.path().join("a"), &[("x", b"12345"), ("d/y", b"67")]);
    create_dir_tree(&temp.path().join("b"), &[("z", b"1234567")]);
    create_dir_tree(&temp.path().join("c"), &[("z", b"123")]);

    let same = treepatch(&["verify", "--target", path_str(&temp.path().join("a")), "--expected", path_str(&temp.path().join("b"))]);
    assert_eq!(same.status.code(), Some(0));

    let differ = treepatch(&["verify", "--target", path_str(&temp.path().join("a")), "--expected", path_str(&temp.path().join("c"))]);
    assert_eq!(differ.status.code(), Some(2));
}
