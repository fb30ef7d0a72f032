use anyhow::{Context, Result};
use log::{debug, info, warn};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::binary_diff::{AnchorMatcher, DiffStrategy};
use crate::config::DiffConfig;
use crate::patch_format::{
    self, ApplySummary, Change, DirEntryDiff, DirectoryDiff, FileDiff, Operation, PathKey,
};
use crate::util::{self, DirEntry, EntryKind};

/// One relative path of the union of both trees.
enum DiffJob {
    Both {
        rel_path: String,
        old_path: PathBuf,
        new_path: PathBuf,
    },
    OldOnly {
        rel_path: String,
        size: u64,
    },
    NewOnly {
        rel_path: String,
        new_path: PathBuf,
    },
}

/// Files of one tree by case-insensitive path. Of two files differing only by case, the later
/// one in walk order is kept.
fn files_by_key(entries: Vec<DirEntry>) -> BTreeMap<PathKey, DirEntry> {
    let mut files = BTreeMap::new();
    for entry in entries.into_iter().filter(|e| e.kind == EntryKind::File) {
        let key = PathKey::new(entry.relative_path.clone());
        if let Some(dropped) = files.insert(key, entry) {
            warn!(
                "{} differs only by case from another file in the same tree; leaving it out of the diff",
                dropped.relative_path
            );
        }
    }
    files
}

/// Pair up the files of both trees by case-insensitive relative path. Paired files keep the old
/// tree's spelling, since that is what exists where the patch is applied.
fn plan_jobs(old_entries: Vec<DirEntry>, new_entries: Vec<DirEntry>) -> Vec<DiffJob> {
    let mut old_files = files_by_key(old_entries);
    let new_files = files_by_key(new_entries);

    let mut jobs = Vec::with_capacity(old_files.len().max(new_files.len()));
    for (key, new_entry) in new_files {
        match old_files.remove(&key) {
            Some(old_entry) => jobs.push(DiffJob::Both {
                rel_path: old_entry.relative_path,
                old_path: old_entry.full_path,
                new_path: new_entry.full_path,
            }),
            None => jobs.push(DiffJob::NewOnly {
                rel_path: new_entry.relative_path,
                new_path: new_entry.full_path,
            }),
        }
    }
    for (_, old_entry) in old_files {
        jobs.push(DiffJob::OldOnly {
            rel_path: old_entry.relative_path,
            size: old_entry.size,
        });
    }
    jobs
}

fn run_job(job: &DiffJob, strategy: &dyn DiffStrategy) -> Result<(String, DirEntryDiff)> {
    match job {
        DiffJob::Both {
            rel_path,
            old_path,
            new_path,
        } => {
            let old_data = util::mmap_file(old_path)?;
            let new_data = util::mmap_file(new_path)?;
            let diff = strategy.diff(&old_data, &new_data);
            debug!("{}: {} operations", rel_path, diff.len());
            Ok((
                rel_path.clone(),
                DirEntryDiff {
                    change: Change::Modified,
                    diff,
                    blake3_hash: Some(util::hash_bytes(&new_data)),
                },
            ))
        }
        DiffJob::OldOnly { rel_path, size } => Ok((
            rel_path.clone(),
            DirEntryDiff {
                change: Change::Removed,
                diff: FileDiff::new(vec![Operation::Delete {
                    old_offset: 0,
                    length: *size,
                }]),
                blake3_hash: None,
            },
        )),
        DiffJob::NewOnly { rel_path, new_path } => {
            let data = std::fs::read(new_path)
                .with_context(|| format!("Failed to read file: {}", new_path.display()))?;
            let hash = util::hash_bytes(&data);
            Ok((
                rel_path.clone(),
                DirEntryDiff {
                    change: Change::Added,
                    diff: FileDiff::new(vec![Operation::Insert {
                        new_offset: 0,
                        data,
                    }]),
                    blake3_hash: Some(hash),
                },
            ))
        }
    }
}

/// Compute the per-file diffs turning `old_dir` into `new_dir`.
/// Walks both trees concurrently with Tokio and diffs files in parallel with Rayon.
pub async fn diff_directories(
    old_dir: &Path,
    new_dir: &Path,
    config: &DiffConfig,
) -> Result<DirectoryDiff> {
    let old_dir_owned = old_dir.to_path_buf();
    let new_dir_owned = new_dir.to_path_buf();

    let (old_entries, new_entries) = tokio::try_join!(
        tokio::task::spawn_blocking(move || util::walk_directory(&old_dir_owned)),
        tokio::task::spawn_blocking(move || util::walk_directory(&new_dir_owned)),
    )?;

    let jobs = plan_jobs(old_entries?, new_entries?);
    let matcher = AnchorMatcher::new(config.clone());

    let results = tokio::task::spawn_blocking(move || -> Result<Vec<(String, DirEntryDiff)>> {
        jobs.par_iter()
            .map(|job| run_job(job, &matcher))
            .collect()
    })
    .await??;

    let mut diff = DirectoryDiff::new();
    for (path, entry) in results {
        diff.insert(path, entry);
    }

    info!(
        "directory diff: {} added, {} modified, {} removed",
        diff.count(Change::Added),
        diff.count(Change::Modified),
        diff.count(Change::Removed)
    );
    Ok(diff)
}

/// Diff two directories and write the result as a patch file.
pub async fn create_patch(
    old_dir: &Path,
    new_dir: &Path,
    output: &Path,
    config: &DiffConfig,
) -> Result<ApplySummary> {
    let diff = diff_directories(old_dir, new_dir, config).await?;
    let summary = summarize(&diff);

    let file = std::fs::File::create(output)
        .with_context(|| format!("Failed to create output file: {}", output.display()))?;
    let mut writer = BufWriter::new(file);
    patch_format::write_patch(&mut writer, diff)?;
    writer.flush()?;

    Ok(summary)
}

/// Counts for a diff as it would apply to its old tree.
pub fn summarize(diff: &DirectoryDiff) -> ApplySummary {
    let mut summary = ApplySummary::default();
    for (_, entry) in diff.iter() {
        match entry.change {
            Change::Added => summary.files_added += 1,
            Change::Removed => summary.files_deleted += 1,
            Change::Modified => {
                let old_len = entry.diff.iter().fold(0u64, |acc, op| match op {
                    Operation::Copy { length, .. } | Operation::Delete { length, .. } => acc + length,
                    _ => acc,
                });
                if entry.diff.is_identity(old_len) {
                    summary.files_unchanged += 1;
                } else {
                    summary.files_modified += 1;
                }
            }
        }
    }
    summary
}
