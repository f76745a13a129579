use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use crate::tool::{BuiltinTool, DeltaTool, ExternalTool, ToolKind};

/// Engine settings. Every entry point takes one explicitly; nothing is read
/// from the environment or baked in.
#[derive(Debug, Clone, Default)]
pub struct PatchConfig {
    pub tool: ToolKind,
    /// Worker threads for per-file phases. `None` lets rayon pick.
    pub jobs: Option<usize>,
    /// Override the external diff executable (bsdiff/xdelta3 only).
    pub diff_program: Option<PathBuf>,
    /// Override the external patch executable (bsdiff/xdelta3 only).
    pub patch_program: Option<PathBuf>,
}

impl PatchConfig {
    pub fn new(tool: ToolKind) -> Self {
        Self {
            tool,
            ..Self::default()
        }
    }

    pub fn build_tool(&self, kind: ToolKind) -> Arc<dyn DeltaTool> {
        let external = match kind {
            ToolKind::Builtin => return Arc::new(BuiltinTool),
            ToolKind::Bsdiff => ExternalTool::bsdiff(),
            ToolKind::Xdelta3 => ExternalTool::xdelta3(),
        };
        Arc::new(external.with_programs(self.diff_program.clone(), self.patch_program.clone()))
    }

    pub fn thread_pool(&self) -> Result<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs.unwrap_or(0))
            .thread_name(|i| format!("treepatch-worker-{}", i))
            .build()
            .context("Failed to build worker pool")
    }
}
