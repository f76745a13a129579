mod apply;
mod builtin_delta;
mod classify;
mod config;
mod create;
mod error;
mod manifest;
mod mirror;
mod patch_format;
mod rolling_hash;
mod tool;
mod util;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use crate::apply::Expected;
use crate::config::PatchConfig;
use crate::patch_format::{FileFailure, FileIdentity, Verification};
use crate::tool::ToolKind;

const EXIT_FAILURES: u8 = 1;
const EXIT_INTEGRITY: u8 = 2;

#[derive(Parser)]
#[command(name = "treepatch", about = "Directory tree patch creator and applier")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Worker threads for per-file operations (default: one per core)
    #[arg(short, long, global = true)]
    jobs: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ToolArgs {
    /// Delta tool: builtin, bsdiff or xdelta3
    #[arg(long, short)]
    tool: Option<String>,
    /// Path to the diff executable for external tools
    #[arg(long)]
    diff_program: Option<PathBuf>,
    /// Path to the patch executable for external tools
    #[arg(long)]
    patch_program: Option<PathBuf>,
}

impl ToolArgs {
    fn kind(&self) -> Result<Option<ToolKind>> {
        Ok(self.tool.as_deref().map(str::parse::<ToolKind>).transpose()?)
    }

    fn config(&self, jobs: Option<usize>) -> Result<PatchConfig> {
        Ok(PatchConfig {
            jobs,
            diff_program: self.diff_program.clone(),
            patch_program: self.patch_program.clone(),
            ..PatchConfig::new(self.kind()?.unwrap_or_default())
        })
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compare the origin and modified trees and write an artifact directory
    Create {
        /// Path to the origin (old) tree
        #[arg(long)]
        origin: PathBuf,
        /// Path to the modified (new) tree
        #[arg(long)]
        modified: PathBuf,
        /// Artifact directory to create (must be absent or empty)
        #[arg(long, short)]
        output: PathBuf,
        #[command(flatten)]
        tool: ToolArgs,
    },
    /// Replay an artifact directory onto a copy of the origin tree
    Apply {
        /// Tree to patch in place
        #[arg(long)]
        target: PathBuf,
        /// Artifact directory produced by `create`
        #[arg(long, short)]
        patch: PathBuf,
        /// Local copy of the modified tree to verify against (default: size from the patch header)
        #[arg(long)]
        expected: Option<PathBuf>,
        #[command(flatten)]
        tool: ToolArgs,
    },
    /// Show how files would be classified, without writing anything
    Plan {
        #[arg(long)]
        origin: PathBuf,
        #[arg(long)]
        modified: PathBuf,
    },
    /// Create a delta for a single file
    DiffFile {
        #[arg(long)]
        old: PathBuf,
        #[arg(long)]
        new: PathBuf,
        #[arg(long, short)]
        output: PathBuf,
        #[command(flatten)]
        tool: ToolArgs,
    },
    /// Rebuild a single file from its old version and a delta
    PatchFile {
        #[arg(long)]
        old: PathBuf,
        #[arg(long, short)]
        patch: PathBuf,
        #[arg(long, short)]
        output: PathBuf,
        #[command(flatten)]
        tool: ToolArgs,
    },
    /// Compare the total byte size of two trees
    Verify {
        #[arg(long)]
        target: PathBuf,
        #[arg(long)]
        expected: PathBuf,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_failures(failures: &[FileFailure]) {
    for failure in failures {
        println!("    [{}] {}: {}", failure.stage, failure.path, failure.reason);
    }
}

fn print_list(title: &str, entries: &[FileIdentity]) {
    println!("{} ({}):", title, entries.len());
    for id in entries {
        println!("  {}", id);
    }
}

fn report_verification(verification: &Verification) -> ExitCode {
    if verification.matches() {
        println!("  Integrity check: OK ({} bytes)", verification.actual_size);
        ExitCode::SUCCESS
    } else {
        println!(
            "  Integrity check: FAILED (target {} bytes, expected {} bytes)",
            verification.actual_size, verification.expected_size
        );
        ExitCode::from(EXIT_INTEGRITY)
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Create { origin, modified, output, tool } => {
            let config = tool.config(cli.jobs)?;
            println!("Creating patch...");
            println!("  Origin: {}", origin.display());
            println!("  Modified: {}", modified.display());
            println!("  Output: {}", output.display());
            println!("  Tool: {}", config.tool);

            let start = Instant::now();
            let summary = create::create_patch(&origin, &modified, &output, &config).await?;
            let elapsed = start.elapsed();

            println!("\nPatch created.");
            println!("  Directories mirrored: {}", summary.dirs_mirrored);
            println!("  Files added: {}", summary.files_added);
            println!("  Files modified: {}", summary.files_modified);
            println!("  Files deleted: {}", summary.files_deleted);
            println!("  Shipped in full after failed delta: {}", summary.reclassified.len());
            for id in &summary.reclassified {
                println!("    {}", id);
            }
            println!("  Expected tree size: {} bytes", summary.expected_size);
            println!("  Failed operations: {}", summary.failures.len());
            print_failures(&summary.failures);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());

            if summary.failures.is_empty() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_FAILURES))
            }
        }
        Commands::Apply { target, patch, expected, tool } => {
            let config = tool.config(cli.jobs)?;
            let tool_override = tool.kind()?;
            println!("Applying patch...");
            println!("  Target: {}", target.display());
            println!("  Patch: {}", patch.display());

            let expected = match &expected {
                Some(path) => {
                    util::require_path(path)?;
                    Expected::Tree(path)
                }
                None => Expected::Header,
            };

            let start = Instant::now();
            let summary =
                apply::apply_patch(&target, &patch, expected, tool_override, &config).await?;
            let elapsed = start.elapsed();

            println!("\nPatch applied.");
            println!("  Files deleted: {}", summary.files_deleted);
            println!("  Files added: {}", summary.files_added);
            println!("  Files modified: {}", summary.files_modified);
            println!("  Directories pruned: {}", summary.dirs_pruned);
            println!("  Operations applied: {}", summary.applied());
            println!("  Failed operations: {}", summary.failures.len());
            print_failures(&summary.failures);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
            let verdict = report_verification(&summary.verification);

            if !summary.verification.matches() {
                Ok(verdict)
            } else if !summary.failures.is_empty() {
                Ok(ExitCode::from(EXIT_FAILURES))
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
        Commands::Plan { origin, modified } => {
            let changes = blocking(move || {
                let o = util::walk_tree(&origin)?;
                let m = util::walk_tree(&modified)?;
                Ok(classify::classify(&o, &m))
            })
            .await?;
            print_list("New", &changes.new_files);
            print_list("Modified", &changes.modified_files);
            print_list("Deleted", &changes.deleted_files);
            println!("Total: {}", changes.total());
            Ok(ExitCode::SUCCESS)
        }
        Commands::DiffFile { old, new, output, tool } => {
            let config = tool.config(cli.jobs)?;
            util::require_path(&old)?;
            util::require_path(&new)?;
            let delta = config.build_tool(config.tool);
            blocking(move || delta.diff(&old, &new, &output)).await?;
            println!("Delta written.");
            Ok(ExitCode::SUCCESS)
        }
        Commands::PatchFile { old, patch, output, tool } => {
            let config = tool.config(cli.jobs)?;
            util::require_path(&old)?;
            util::require_path(&patch)?;
            let delta = config.build_tool(config.tool);
            blocking(move || delta.patch(&old, &output, &patch)).await?;
            println!("File rebuilt.");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Verify { target, expected } => {
            let verification = blocking(move || {
                Ok(Verification {
                    expected_size: util::tree_size(&expected)?,
                    actual_size: util::tree_size(&target)?,
                })
            })
            .await?;
            Ok(report_verification(&verification))
        }
    }
}
