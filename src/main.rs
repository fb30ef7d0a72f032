use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use treedelta::binary_diff::{self, AnchorMatcher};
use treedelta::binary_patch::{self, PatchOptions};
use treedelta::patch_format::{self, ApplySummary, Change, FileDiffManifest, FORMAT_VERSION};
use treedelta::{apply, create, util, DiffConfig};

#[derive(Parser)]
#[command(name = "treedelta", about = "Binary diff and patch for files and directory trees")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Profile {
    Fast,
    Default,
    Thorough,
}

impl Profile {
    fn config(self, diagnostics: Option<PathBuf>) -> DiffConfig {
        let config = match self {
            Profile::Fast => DiffConfig::fast(),
            Profile::Default => DiffConfig::default(),
            Profile::Thorough => DiffConfig::thorough(),
        };
        match diagnostics {
            Some(dir) => config.with_diagnostics(Some(dir)),
            None => config,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a patch by comparing old and new directories
    Create {
        /// Path to the old (original) directory
        #[arg(long)]
        old: PathBuf,
        /// Path to the new (updated) directory
        #[arg(long)]
        new: PathBuf,
        /// Output path for the patch file
        #[arg(long, short)]
        output: PathBuf,
        /// Matching profile
        #[arg(long, value_enum, default_value = "default")]
        profile: Profile,
    },
    /// Apply a patch to a target directory
    Apply {
        /// Path to the target directory to patch
        #[arg(long)]
        target: PathBuf,
        /// Path to the patch file
        #[arg(long, short)]
        patch: PathBuf,
        /// Reject operation lists with holes instead of zero-filling them
        #[arg(long)]
        strict: bool,
    },
    /// Diff two files
    Diff {
        #[arg(long)]
        old: PathBuf,
        #[arg(long)]
        new: PathBuf,
        #[arg(long, short)]
        output: PathBuf,
        #[arg(long, value_enum, default_value = "default")]
        profile: Profile,
        /// Keep staged inputs in this directory if diffing fails
        #[arg(long)]
        diagnostics: Option<PathBuf>,
    },
    /// Rebuild a file from its old version and a file diff
    Patch {
        #[arg(long)]
        old: PathBuf,
        #[arg(long)]
        diff: PathBuf,
        #[arg(long, short)]
        output: PathBuf,
        #[arg(long)]
        strict: bool,
    },
    /// Print what a patch or file diff contains
    Inspect { patch: PathBuf },
}

fn print_summary(summary: &ApplySummary) {
    println!("  Files added: {}", summary.files_added);
    println!("  Files modified: {}", summary.files_modified);
    println!("  Files unchanged: {}", summary.files_unchanged);
    println!("  Files deleted: {}", summary.files_deleted);
    println!("  Directories removed: {}", summary.dirs_removed);
}

fn options(strict: bool) -> PatchOptions {
    if strict {
        PatchOptions::strict()
    } else {
        PatchOptions::default()
    }
}

fn diff_file(old: &Path, new: &Path, output: &Path, config: DiffConfig) -> Result<()> {
    let old_file =
        File::open(old).with_context(|| format!("Failed to open file: {}", old.display()))?;
    let new_file =
        File::open(new).with_context(|| format!("Failed to open file: {}", new.display()))?;
    let old_len = old_file.metadata()?.len();
    let new_len = new_file.metadata()?.len();

    let diff = if config.diagnostics.enabled {
        binary_diff::diff_readers(old_file, new_file, &config)?
    } else {
        binary_diff::diff_files(old, new, &AnchorMatcher::new(config))?
    };
    println!(
        "  Operations: {} ({} copy, {} insert, {} delete)",
        diff.len(),
        diff.count("copy"),
        diff.count("insert"),
        diff.count("delete")
    );

    let manifest = FileDiffManifest {
        version: FORMAT_VERSION,
        old_len,
        new_len,
        new_blake3_hash: util::hash_file_streaming(new)?,
        diff,
    };
    let out = File::create(output)
        .with_context(|| format!("Failed to create output file: {}", output.display()))?;
    let mut writer = BufWriter::new(out);
    patch_format::write_file_diff(&mut writer, &manifest)?;
    writer.flush()?;
    Ok(())
}

fn patch_file(old: &Path, diff: &Path, output: &Path, options: &PatchOptions) -> Result<()> {
    let diff_file =
        File::open(diff).with_context(|| format!("Failed to open diff: {}", diff.display()))?;
    let manifest = patch_format::read_file_diff(&mut BufReader::new(diff_file))?;

    let mut old_file =
        File::open(old).with_context(|| format!("Failed to open file: {}", old.display()))?;
    let mut staged = binary_patch::apply_staged(&mut old_file, manifest.diff.ops(), options)
        .with_context(|| format!("Failed to patch file: {}", old.display()))?;

    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut staged, &mut hasher)?;
    if *hasher.finalize().as_bytes() != manifest.new_blake3_hash {
        return Err(anyhow!("Hash mismatch after patching: {}", old.display()));
    }
    std::io::Seek::rewind(&mut staged)?;

    let mut dest = File::create(output)
        .with_context(|| format!("Failed to create output file: {}", output.display()))?;
    binary_patch::commit_staged(staged, &mut dest)?;
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("Failed to open patch: {}", path.display()))?,
    );
    let mut magic = [0u8; 8];
    std::io::Read::read_exact(&mut reader, &mut magic)?;
    let mut reader = std::io::Read::chain(&magic[..], reader);

    if &magic == patch_format::DIR_MAGIC {
        let diff = patch_format::read_patch(&mut reader)?;
        println!("Directory patch: {} entries", diff.len());
        for (path, entry) in diff.iter() {
            let tag = match entry.change {
                Change::Added => "A",
                Change::Removed => "D",
                Change::Modified => "M",
            };
            println!("  {} {} ({} ops)", tag, path, entry.diff.len());
        }
    } else {
        let manifest = patch_format::read_file_diff(&mut reader)?;
        println!(
            "File diff: {} -> {} bytes, {} ops",
            manifest.old_len,
            manifest.new_len,
            manifest.diff.len()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp(None)
        .format_target(false)
        .init();

    let cli = Cli::parse();
    let start = Instant::now();

    match cli.command {
        Commands::Create {
            old,
            new,
            output,
            profile,
        } => {
            println!("Creating patch...");
            println!("  Old: {}", old.display());
            println!("  New: {}", new.display());
            println!("  Output: {}", output.display());

            let summary = create::create_patch(&old, &new, &output, &profile.config(None)).await?;

            println!("\nPatch created successfully!");
            print_summary(&summary);
        }
        Commands::Apply {
            target,
            patch,
            strict,
        } => {
            println!("Applying patch...");
            println!("  Target: {}", target.display());
            println!("  Patch: {}", patch.display());

            let summary = apply::apply_patch(&target, &patch, options(strict)).await?;

            println!("\nPatch applied successfully!");
            print_summary(&summary);
        }
        Commands::Diff {
            old,
            new,
            output,
            profile,
            diagnostics,
        } => {
            println!("Diffing {} -> {}", old.display(), new.display());
            let config = profile.config(diagnostics);
            tokio::task::spawn_blocking(move || diff_file(&old, &new, &output, config)).await??;
        }
        Commands::Patch {
            old,
            diff,
            output,
            strict,
        } => {
            println!("Patching {} -> {}", old.display(), output.display());
            patch_file(&old, &diff, &output, &options(strict))?;
        }
        Commands::Inspect { patch } => inspect(&patch)?,
    }

    println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
    Ok(())
}
