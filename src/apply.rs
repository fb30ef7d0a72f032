use anyhow::{bail, Context, Result};
use log::{debug, info};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use crate::binary_patch::{self, PatchOptions};
use crate::error::PatchError;
use crate::patch_format::{self, ApplySummary, Change, DirEntryDiff, DirectoryDiff, Operation};
use crate::util;

/// Join a relative patch path onto `root`, refusing anything that could leave it.
fn resolve(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel_path = Path::new(rel);
    if rel.is_empty() || !rel_path.components().all(|c| matches!(c, Component::Normal(_))) {
        bail!("Refusing unsafe path in patch: {}", rel);
    }
    Ok(root.join(rel_path))
}

/// Execute a whole-file operation below `root`.
/// Returns how many directories a delete left empty and removed, innermost first.
pub fn apply_file_operation(root: &Path, op: &Operation) -> Result<usize> {
    match op {
        Operation::CreateFile { path, data } => {
            let full = resolve(root, path)?;
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
            std::fs::write(&full, data)
                .with_context(|| format!("Failed to write file: {}", full.display()))?;
            Ok(0)
        }
        Operation::DeleteFile { path } => {
            let full = resolve(root, path)?;
            match std::fs::remove_file(&full) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(anyhow::Error::from(e))
                        .with_context(|| format!("Failed to delete file: {}", full.display()))
                }
            }
            // Best effort: stops at the first directory that is not empty.
            let mut removed = 0;
            let mut dir = full.parent();
            while let Some(parent) = dir {
                if parent == root || std::fs::remove_dir(parent).is_err() {
                    break;
                }
                removed += 1;
                dir = parent.parent();
            }
            Ok(removed)
        }
        other => bail!("{} is not a whole-file operation", other.kind()),
    }
}

/// Patch `path` in place, verifying the result against `expected` before it replaces the
/// file's content.
fn modify_file(path: &Path, entry: &DirEntryDiff, options: &PatchOptions) -> Result<bool> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open file for patching: {}", path.display()))?;
    let old_len = file.metadata()?.len();
    if entry.diff.is_identity(old_len) {
        return Ok(false);
    }

    let mut staged = binary_patch::apply_staged(&mut file, entry.diff.ops(), options)
        .with_context(|| format!("Failed to patch file: {}", path.display()))?;

    if let Some(expected) = entry.blake3_hash {
        let actual = hash_staged(&mut staged)?;
        if actual != expected {
            bail!("Hash mismatch after patching file: {}", path.display());
        }
    }

    binary_patch::commit_staged(staged, &mut file)
        .with_context(|| format!("Failed to write patched file: {}", path.display()))?;
    Ok(true)
}

fn hash_staged(staged: &mut File) -> Result<[u8; 32]> {
    let mut hasher = blake3::Hasher::new();
    std::io::copy(staged, &mut hasher).context("Failed to hash patched content")?;
    staged.seek(SeekFrom::Start(0))?;
    Ok(*hasher.finalize().as_bytes())
}

/// Apply an added or removed entry in its whole-file form.
fn apply_whole_file(target: &Path, path: &str, entry: &DirEntryDiff) -> Result<usize> {
    let op = entry
        .file_operation(path)?
        .with_context(|| format!("No whole-file form for modified file: {}", path))?;
    if let (Operation::CreateFile { data, .. }, Some(expected)) = (&op, entry.blake3_hash) {
        if util::hash_bytes(data) != expected {
            bail!("Hash mismatch for added file: {}", path);
        }
    }
    apply_file_operation(target, &op)
}

/// Apply a directory diff to `target`, one entry at a time.
///
/// Removed files go first so that a path can switch between file and directory. Added files
/// are created next, then modified files are patched in place through the staged applier.
/// The first failure stops the run; entries already applied stay applied.
pub fn apply_directory(
    target: &Path,
    diff: &DirectoryDiff,
    options: &PatchOptions,
) -> Result<ApplySummary> {
    let target = target
        .canonicalize()
        .with_context(|| format!("Failed to canonicalize target: {}", target.display()))?;
    let mut summary = ApplySummary::default();

    for change in [Change::Removed, Change::Added, Change::Modified] {
        for (path, entry) in diff.iter().filter(|(_, e)| e.change == change) {
            options.check_cancel()?;
            match change {
                Change::Removed => {
                    summary.dirs_removed += apply_whole_file(&target, path, entry)?;
                    summary.files_deleted += 1;
                }
                Change::Added => {
                    apply_whole_file(&target, path, entry)?;
                    summary.files_added += 1;
                }
                Change::Modified => {
                    let full = resolve(&target, path)?;
                    if modify_file(&full, entry, options)? {
                        summary.files_modified += 1;
                    } else {
                        summary.files_unchanged += 1;
                    }
                }
            }
            debug!("applied {:?} {}", change, path);
        }
    }

    info!(
        "applied patch: {} added, {} modified, {} deleted",
        summary.files_added, summary.files_modified, summary.files_deleted
    );
    Ok(summary)
}

/// Read a patch file and apply it to `target_dir` on the blocking pool.
pub async fn apply_patch(
    target_dir: &Path,
    patch_path: &Path,
    options: PatchOptions,
) -> Result<ApplySummary> {
    let file = File::open(patch_path)
        .with_context(|| format!("Failed to open patch file: {}", patch_path.display()))?;
    let diff = patch_format::read_patch(&mut BufReader::new(file))?;

    let target = target_dir.to_path_buf();
    tokio::task::spawn_blocking(move || apply_directory(&target, &diff, &options)).await?
}

/// Whether an error chain ended in a cancelled patch.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<PatchError>(), Some(PatchError::Cancelled)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary_patch::CancelToken;
    use crate::patch_format::FileDiff;

    #[test]
    fn test_create_file_makes_parents() {
        let dir = tempfile::tempdir().unwrap();
        let op = Operation::CreateFile {
            path: "deep/er/file.txt".into(),
            data: b"content".to_vec(),
        };
        assert_eq!(apply_file_operation(dir.path(), &op).unwrap(), 0);
        assert_eq!(
            std::fs::read(dir.path().join("deep/er/file.txt")).unwrap(),
            b"content"
        );
    }

    #[test]
    fn test_delete_file_removes_empty_parent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"b").unwrap();

        let delete = |name: &str| {
            apply_file_operation(
                dir.path(),
                &Operation::DeleteFile {
                    path: format!("sub/{name}"),
                },
            )
            .unwrap()
        };
        assert_eq!(delete("a.txt"), 0);
        assert!(dir.path().join("sub").exists());
        assert_eq!(delete("b.txt"), 1);
        assert!(!dir.path().join("sub").exists());
    }

    #[test]
    fn test_delete_file_removes_emptied_ancestors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        std::fs::write(dir.path().join("a/keep.txt"), b"k").unwrap();
        std::fs::write(dir.path().join("a/b/c/leaf.txt"), b"l").unwrap();

        let op = Operation::DeleteFile {
            path: "a/b/c/leaf.txt".into(),
        };
        assert_eq!(apply_file_operation(dir.path(), &op).unwrap(), 2);
        assert!(!dir.path().join("a/b").exists());
        assert!(dir.path().join("a/keep.txt").exists());
    }

    #[test]
    fn test_delete_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let op = Operation::DeleteFile {
            path: "never-existed.txt".into(),
        };
        assert_eq!(apply_file_operation(dir.path(), &op).unwrap(), 0);
        assert!(dir.path().exists());
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        for path in ["../evil.txt", "/etc/passwd", "a/../../b", ""] {
            let op = Operation::CreateFile {
                path: path.into(),
                data: vec![],
            };
            assert!(apply_file_operation(dir.path(), &op).is_err(), "{path}");
        }
    }

    #[test]
    fn test_byte_operations_are_not_whole_file_operations() {
        let dir = tempfile::tempdir().unwrap();
        let op = Operation::Delete {
            old_offset: 0,
            length: 1,
        };
        assert!(apply_file_operation(dir.path(), &op).is_err());
    }

    #[test]
    fn test_modified_hash_mismatch_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, b"original").unwrap();

        let mut diff = DirectoryDiff::new();
        diff.insert(
            "f.bin",
            DirEntryDiff {
                change: Change::Modified,
                diff: FileDiff::new(vec![Operation::Insert {
                    new_offset: 0,
                    data: b"replaced".to_vec(),
                }]),
                blake3_hash: Some([0; 32]),
            },
        );
        assert!(apply_directory(dir.path(), &diff, &PatchOptions::default()).is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"original");
    }

    #[test]
    fn test_cancelled_before_first_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut diff = DirectoryDiff::new();
        diff.insert(
            "new.txt",
            DirEntryDiff {
                change: Change::Added,
                diff: FileDiff::new(vec![Operation::Insert {
                    new_offset: 0,
                    data: b"x".to_vec(),
                }]),
                blake3_hash: None,
            },
        );
        let token = CancelToken::new();
        token.cancel();
        let err = apply_directory(dir.path(), &diff, &PatchOptions::default().with_cancel(token))
            .unwrap_err();
        assert!(is_cancelled(&err));
        assert!(!dir.path().join("new.txt").exists());
    }

    #[test]
    fn test_added_entry_with_copy_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut diff = DirectoryDiff::new();
        diff.insert(
            "huge.bin",
            DirEntryDiff {
                change: Change::Added,
                diff: FileDiff::new(vec![Operation::Copy {
                    old_offset: 0,
                    new_offset: 0,
                    length: u64::MAX / 2,
                }]),
                blake3_hash: None,
            },
        );
        assert!(apply_directory(dir.path(), &diff, &PatchOptions::default()).is_err());
        assert!(!dir.path().join("huge.bin").exists());
    }
}
