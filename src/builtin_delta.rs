//! In-process delta backend.
//!
//! Block matching in the rsync style: the source is cut into fixed blocks
//! indexed by their Adler-32 checksum, the target is scanned with a rolling
//! window, and every hit is extended byte by byte as far as the two files agree.
//! The artifact is `MAGIC` followed by a zstd-compressed bincode [`DeltaArtifact`].

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use crate::rolling_hash::RollingHash;
use crate::util;

pub const MAGIC: &[u8; 8] = b"TPDELTA1";
pub const BLOCK_SIZE: usize = 4096;
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOp {
    Copy { offset: u64, length: u64 },
    Literal(Vec<u8>),
}

#[derive(Debug, Serialize, Deserialize)]
struct DeltaArtifact {
    source_len: u64,
    target_len: u64,
    target_hash: [u8; 32],
    ops: Vec<DeltaOp>,
}

/// Already-compressed formats gain nothing from block matching; ship them as a
/// single literal.
fn is_incompressible(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    matches!(
        ext.as_deref(),
        Some(
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "avif"
                | "mp4" | "mkv" | "mov" | "webm"
                | "mp3" | "ogg" | "flac" | "opus"
                | "zip" | "gz" | "bz2" | "xz" | "zst" | "7z" | "rar"
                | "docx" | "xlsx" | "pptx" | "woff2" | "pdf"
        )
    )
}

struct BlockIndex<'a> {
    source: &'a [u8],
    offsets: HashMap<u32, Vec<usize>>,
}

impl<'a> BlockIndex<'a> {
    fn build(source: &'a [u8]) -> Self {
        let mut offsets: HashMap<u32, Vec<usize>> =
            HashMap::with_capacity(source.len() / BLOCK_SIZE);
        for (i, block) in source.chunks_exact(BLOCK_SIZE).enumerate() {
            offsets
                .entry(RollingHash::over(block).digest())
                .or_default()
                .push(i * BLOCK_SIZE);
        }
        Self { source, offsets }
    }

    fn find(&self, digest: u32, window: &[u8]) -> Option<usize> {
        self.offsets
            .get(&digest)?
            .iter()
            .copied()
            .find(|&off| &self.source[off..off + BLOCK_SIZE] == window)
    }
}

fn push_literal(ops: &mut Vec<DeltaOp>, bytes: &[u8]) {
    if !bytes.is_empty() {
        ops.push(DeltaOp::Literal(bytes.to_vec()));
    }
}

fn push_copy(ops: &mut Vec<DeltaOp>, offset: usize, length: usize) {
    if let Some(DeltaOp::Copy { offset: prev, length: prev_len }) = ops.last_mut() {
        if *prev + *prev_len == offset as u64 {
            *prev_len += length as u64;
            return;
        }
    }
    ops.push(DeltaOp::Copy {
        offset: offset as u64,
        length: length as u64,
    });
}

/// Describe `target` as copies out of `source` plus literal bytes.
pub fn compute_delta(source: &[u8], target: &[u8]) -> Vec<DeltaOp> {
    let mut ops = Vec::new();
    if source.len() < BLOCK_SIZE || target.len() < BLOCK_SIZE {
        push_literal(&mut ops, target);
        return ops;
    }

    let index = BlockIndex::build(source);
    let mut window = RollingHash::over(&target[..BLOCK_SIZE]);
    let mut pos = 0;
    let mut literal_start = 0;

    while pos + BLOCK_SIZE <= target.len() {
        if let Some(offset) = index.find(window.digest(), &target[pos..pos + BLOCK_SIZE]) {
            push_literal(&mut ops, &target[literal_start..pos]);

            let mut length = BLOCK_SIZE;
            while offset + length < source.len()
                && pos + length < target.len()
                && source[offset + length] == target[pos + length]
            {
                length += 1;
            }
            push_copy(&mut ops, offset, length);

            pos += length;
            literal_start = pos;
            if pos + BLOCK_SIZE <= target.len() {
                window = RollingHash::over(&target[pos..pos + BLOCK_SIZE]);
            }
        } else {
            if pos + BLOCK_SIZE < target.len() {
                window.roll(target[pos], target[pos + BLOCK_SIZE]);
            }
            pos += 1;
        }
    }

    push_literal(&mut ops, &target[literal_start..]);
    ops
}

/// Rebuild the target from `source` and `ops`. Copies reaching outside the
/// source are an error, not a panic.
pub fn apply_delta(source: &[u8], ops: &[DeltaOp]) -> Result<Vec<u8>> {
    let capacity: u64 = ops
        .iter()
        .map(|op| match op {
            DeltaOp::Copy { length, .. } => *length,
            DeltaOp::Literal(bytes) => bytes.len() as u64,
        })
        .sum();
    let mut out = Vec::with_capacity(capacity as usize);

    for op in ops {
        match op {
            DeltaOp::Copy { offset, length } => {
                let range = usize::try_from(*offset)
                    .ok()
                    .zip(offset.checked_add(*length).and_then(|end| usize::try_from(end).ok()))
                    .and_then(|(start, end)| source.get(start..end))
                    .with_context(|| {
                        format!(
                            "copy {}+{} is outside the {}-byte source",
                            offset,
                            length,
                            source.len()
                        )
                    })?;
                out.extend_from_slice(range);
            }
            DeltaOp::Literal(bytes) => out.extend_from_slice(bytes),
        }
    }
    Ok(out)
}

/// Encode the delta from `old` to `new` into the artifact file `patch`.
pub fn diff_files(old: &Path, new: &Path, patch: &Path) -> Result<()> {
    let source = util::mmap_file(old)?;
    let target = util::mmap_file(new)?;

    let ops = if is_incompressible(new) {
        let mut ops = Vec::new();
        push_literal(&mut ops, &target);
        ops
    } else {
        compute_delta(&source, &target)
    };

    let artifact = DeltaArtifact {
        source_len: source.len() as u64,
        target_len: target.len() as u64,
        target_hash: util::hash_bytes(&target),
        ops,
    };

    let file = std::fs::File::create(patch)
        .with_context(|| format!("Failed to create delta: {}", patch.display()))?;
    let mut writer = std::io::BufWriter::new(file);
    writer.write_all(MAGIC)?;
    let mut encoder = zstd::Encoder::new(writer, ZSTD_LEVEL).context("Failed to start zstd encoder")?;
    bincode::serialize_into(&mut encoder, &artifact).context("Failed to encode delta")?;
    encoder
        .finish()
        .context("Failed to finish zstd stream")?
        .flush()
        .with_context(|| format!("Failed to write delta: {}", patch.display()))?;
    Ok(())
}

/// Rebuild `out` from `old` and the artifact at `patch`. `old` and `out` may be
/// the same path.
pub fn patch_file(old: &Path, out: &Path, patch: &Path) -> Result<()> {
    let raw = util::mmap_file(patch)?;
    if raw.len() < MAGIC.len() || &raw[..MAGIC.len()] != MAGIC {
        bail!("Not a builtin delta: {}", patch.display());
    }
    let decoder = zstd::Decoder::new(&raw[MAGIC.len()..]).context("Failed to create zstd decoder")?;
    let artifact: DeltaArtifact =
        bincode::deserialize_from(decoder).context("Failed to decode delta")?;

    // Scope the mapping so it is released before `out` (possibly `old`) is rewritten.
    let rebuilt = {
        let source = util::mmap_file(old)?;
        ensure!(
            source.len() as u64 == artifact.source_len,
            "source is {} bytes, delta expects {}",
            source.len(),
            artifact.source_len
        );
        apply_delta(&source, &artifact.ops)?
    };

    ensure!(
        rebuilt.len() as u64 == artifact.target_len,
        "rebuilt {} bytes, expected {}",
        rebuilt.len(),
        artifact.target_len
    );
    ensure!(
        util::hash_bytes(&rebuilt) == artifact.target_hash,
        "hash mismatch after patching {}",
        old.display()
    );

    std::fs::write(out, &rebuilt)
        .with_context(|| format!("Failed to write patched file: {}", out.display()))?;
    Ok(())
}
