use anyhow::Result;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use tracing::debug;

use crate::builtin_delta;
use crate::error::PatchError;

/// A byte-level delta backend, treated as a black box: it either produces or
/// consumes one artifact for one file, and succeeds or fails.
///
/// Argument order is positional: `(input_a, input_b, output_or_patch)`.
pub trait DeltaTool: Send + Sync {
    fn name(&self) -> &str;

    /// Write the delta turning `old` into `new` to `patch`.
    fn diff(&self, old: &Path, new: &Path, patch: &Path) -> Result<()>;

    /// Rebuild the new file from `old` and `patch` into `out`.
    fn patch(&self, old: &Path, out: &Path, patch: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolKind {
    #[default]
    Builtin,
    Bsdiff,
    Xdelta3,
}

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Builtin => "builtin",
            ToolKind::Bsdiff => "bsdiff",
            ToolKind::Xdelta3 => "xdelta3",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = PatchError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "builtin" => Ok(ToolKind::Builtin),
            "bsdiff" | "bspatch" => Ok(ToolKind::Bsdiff),
            "xdelta3" | "xdelta" => Ok(ToolKind::Xdelta3),
            _ => Err(PatchError::UnsupportedTool(s.to_string())),
        }
    }
}

pub struct BuiltinTool;

impl DeltaTool for BuiltinTool {
    fn name(&self) -> &str {
        "builtin"
    }

    fn diff(&self, old: &Path, new: &Path, patch: &Path) -> Result<()> {
        builtin_delta::diff_files(old, new, patch)
    }

    fn patch(&self, old: &Path, out: &Path, patch: &Path) -> Result<()> {
        builtin_delta::patch_file(old, out, patch)
    }
}

/// A delta tool run as a child process. Exit code 0 is success; every other
/// code is a failure, with stderr kept for the report.
pub struct ExternalTool {
    name: String,
    diff_program: PathBuf,
    diff_flags: Vec<OsString>,
    patch_program: PathBuf,
    patch_flags: Vec<OsString>,
    /// xdelta3 takes the patch before the output; bspatch takes it last.
    patch_before_output: bool,
}

impl ExternalTool {
    /// `bsdiff old new patch` / `bspatch old new patch`.
    pub fn bsdiff() -> Self {
        Self {
            name: "bsdiff".to_string(),
            diff_program: PathBuf::from("bsdiff"),
            diff_flags: Vec::new(),
            patch_program: PathBuf::from("bspatch"),
            patch_flags: Vec::new(),
            patch_before_output: false,
        }
    }

    /// `xdelta3 -e -f -s old new patch` / `xdelta3 -d -f -s old patch out`.
    pub fn xdelta3() -> Self {
        let flags = |mode: &str| -> Vec<OsString> {
            [mode, "-f", "-s"].into_iter().map(OsString::from).collect()
        };
        Self {
            name: "xdelta3".to_string(),
            diff_program: PathBuf::from("xdelta3"),
            diff_flags: flags("-e"),
            patch_program: PathBuf::from("xdelta3"),
            patch_flags: flags("-d"),
            patch_before_output: true,
        }
    }

    pub fn with_programs(mut self, diff: Option<PathBuf>, patch: Option<PathBuf>) -> Self {
        if let Some(diff) = diff {
            self.diff_program = diff;
        }
        if let Some(patch) = patch {
            self.patch_program = patch;
        }
        self
    }

    fn run(&self, program: &Path, flags: &[OsString], args: [&Path; 3]) -> Result<()> {
        debug!(
            "Running {} {:?} {} {} {}",
            program.display(),
            flags,
            args[0].display(),
            args[1].display(),
            args[2].display()
        );
        let output = Command::new(program)
            .args(flags)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| PatchError::ToolLaunch {
                program: program.display().to_string(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(PatchError::ToolFailed {
                program: program.display().to_string(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into())
        }
    }
}

impl DeltaTool for ExternalTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn diff(&self, old: &Path, new: &Path, patch: &Path) -> Result<()> {
        self.run(&self.diff_program, &self.diff_flags, [old, new, patch])
    }

    fn patch(&self, old: &Path, out: &Path, patch: &Path) -> Result<()> {
        let args = if self.patch_before_output {
            [old, patch, out]
        } else {
            [old, out, patch]
        };
        self.run(&self.patch_program, &self.patch_flags, args)
    }
}
