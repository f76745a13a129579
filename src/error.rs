use std::path::PathBuf;
use thiserror::Error;

/// Run-level failures. Anything listed here stops `create`/`apply` before (or
/// instead of) touching the trees; per-file trouble is reported through
/// [`crate::patch_format::FileFailure`] instead.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("path does not exist: {}", .0.display())]
    PathNotFound(PathBuf),

    #[error("unsupported delta tool '{0}' (supported: builtin, bsdiff, xdelta3)")]
    UnsupportedTool(String),

    /// A file or directory name contains the manifest delimiter or a line break.
    #[error("cannot encode '{identity}' in the manifest: names must not contain \" | \" or line breaks")]
    DelimiterCollision { identity: String },

    #[error("malformed manifest line {line_no} in {}: {line:?}", .file.display())]
    MalformedManifest {
        file: PathBuf,
        line_no: usize,
        line: String,
    },

    #[error("artifact directory is not empty: {}", .0.display())]
    ArtifactDirNotEmpty(PathBuf),

    #[error("unsupported patch format version {found} (expected {expected})")]
    UnsupportedFormat { found: u32, expected: u32 },

    #[error("{program} exited with {status}: {stderr}")]
    ToolFailed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("failed to launch {program}: {source}")]
    ToolLaunch {
        program: String,
        #[source]
        source: std::io::Error,
    },
}
