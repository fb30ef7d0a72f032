use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::ops::Index;

use crate::binary_diff;

pub const DIR_MAGIC: &[u8; 8] = b"TDLTDIR1";
pub const FILE_MAGIC: &[u8; 8] = b"TDLTFIL1";
pub const FORMAT_VERSION: u32 = 1;

/// One unit of transform.
///
/// `Copy`, `Insert` and `Delete` describe a single file's bytes; `CreateFile` and
/// `DeleteFile` act on a whole file inside a directory tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Copy {
        old_offset: u64,
        new_offset: u64,
        length: u64,
    },
    Insert {
        new_offset: u64,
        data: Vec<u8>,
    },
    /// Old range not referenced by any `Copy`. Not needed to rebuild the new content.
    Delete {
        old_offset: u64,
        length: u64,
    },
    CreateFile {
        path: String,
        data: Vec<u8>,
    },
    DeleteFile {
        path: String,
    },
}

impl Operation {
    /// Position this operation contributes to in the new content.
    /// `None` for operations that are not positioned there.
    pub fn new_offset(&self) -> Option<u64> {
        match self {
            Operation::Copy { new_offset, .. } | Operation::Insert { new_offset, .. } => {
                Some(*new_offset)
            }
            _ => None,
        }
    }

    /// Number of bytes this operation writes into the new content.
    pub fn new_len(&self) -> u64 {
        match self {
            Operation::Copy { length, .. } => *length,
            Operation::Insert { data, .. } => data.len() as u64,
            _ => 0,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Copy { .. } => "copy",
            Operation::Insert { .. } => "insert",
            Operation::Delete { .. } => "delete",
            Operation::CreateFile { .. } => "create-file",
            Operation::DeleteFile { .. } => "delete-file",
        }
    }
}

/// Ordered operation list turning one file's old bytes into its new bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileDiff {
    ops: Vec<Operation>,
}

impl FileDiff {
    pub fn new(ops: Vec<Operation>) -> Self {
        Self { ops }
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<Operation> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Operation> {
        self.ops.iter()
    }

    /// Fuse adjacent operations. Running it twice yields the same list.
    pub fn merged(self) -> Self {
        Self {
            ops: binary_diff::merge_ops(self.ops),
        }
    }

    /// Length of the content this diff rebuilds.
    pub fn new_len(&self) -> u64 {
        self.ops.iter().map(Operation::new_len).sum()
    }

    /// True when applying the diff to `old_len` bytes would reproduce them unchanged.
    pub fn is_identity(&self, old_len: u64) -> bool {
        match self.ops.as_slice() {
            [] => old_len == 0,
            [Operation::Copy {
                old_offset: 0,
                new_offset: 0,
                length,
            }] => *length == old_len,
            _ => false,
        }
    }

    pub fn count(&self, kind: &str) -> usize {
        self.ops.iter().filter(|op| op.kind() == kind).count()
    }
}

impl<'a> IntoIterator for &'a FileDiff {
    type Item = &'a Operation;
    type IntoIter = std::slice::Iter<'a, Operation>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.iter()
    }
}

/// Relative path compared without regard to case.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathKey(String);

impl PathKey {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn folded(&self) -> impl Iterator<Item = char> + '_ {
        self.0.chars().flat_map(char::to_lowercase)
    }
}

impl PartialEq for PathKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PathKey {}

impl PartialOrd for PathKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PathKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.folded().cmp(other.folded())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    /// Present only in the new tree.
    Added,
    /// Present only in the old tree.
    Removed,
    /// Present in both trees.
    Modified,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntryDiff {
    pub change: Change,
    pub diff: FileDiff,
    /// BLAKE3 of the expected new content; `None` for removed files.
    pub blake3_hash: Option<[u8; 32]>,
}

impl DirEntryDiff {
    /// `CreateFile` for an added entry, `DeleteFile` for a removed one, `None` when modified.
    ///
    /// An added file has no old content, so its diff must be contiguous inserts from offset 0.
    pub fn file_operation(&self, path: &str) -> Result<Option<Operation>> {
        match self.change {
            Change::Added => {
                let mut content = Vec::new();
                for op in &self.diff {
                    match op {
                        Operation::Insert { new_offset, data } if *new_offset == content.len() as u64 => {
                            content.extend_from_slice(data)
                        }
                        other => bail!(
                            "Invalid patch: added file {} has a misplaced {} operation",
                            path,
                            other.kind()
                        ),
                    }
                }
                Ok(Some(Operation::CreateFile {
                    path: path.to_string(),
                    data: content,
                }))
            }
            Change::Removed => Ok(Some(Operation::DeleteFile {
                path: path.to_string(),
            })),
            Change::Modified => Ok(None),
        }
    }
}

/// Per-relative-path map of file diffs describing a whole-tree transform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryDiff {
    entries: BTreeMap<PathKey, DirEntryDiff>,
}

impl DirectoryDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, entry: DirEntryDiff) {
        self.entries.insert(PathKey::new(path), entry);
    }

    pub fn get(&self, path: &str) -> Option<&FileDiff> {
        self.entry(path).map(|e| &e.diff)
    }

    pub fn entry(&self, path: &str) -> Option<&DirEntryDiff> {
        self.entries.get(&PathKey::new(path))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DirEntryDiff)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, change: Change) -> usize {
        self.entries.values().filter(|e| e.change == change).count()
    }
}

impl Index<&str> for DirectoryDiff {
    type Output = FileDiff;

    fn index(&self, path: &str) -> &FileDiff {
        match self.get(path) {
            Some(diff) => diff,
            None => panic!("no diff recorded for path: {path}"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PatchManifest {
    pub version: u32,
    pub diff: DirectoryDiff,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FileDiffManifest {
    pub version: u32,
    pub old_len: u64,
    pub new_len: u64,
    pub new_blake3_hash: [u8; 32],
    pub diff: FileDiff,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplySummary {
    pub files_added: usize,
    pub files_modified: usize,
    pub files_unchanged: usize,
    pub files_deleted: usize,
    pub dirs_removed: usize,
}

fn write_container<W: Write, T: Serialize>(out: &mut W, magic: &[u8; 8], value: &T) -> Result<()> {
    out.write_all(magic)?;
    bincode::serialize_into(&mut *out, value).context("Failed to serialize patch")?;
    out.flush()?;
    Ok(())
}

fn read_container<R: Read, T: DeserializeOwned>(input: &mut R, magic: &[u8; 8]) -> Result<T> {
    let mut header = [0u8; 8];
    input
        .read_exact(&mut header)
        .context("Invalid patch file: missing magic header")?;
    if &header != magic {
        bail!("Invalid patch file: missing magic header");
    }
    bincode::deserialize_from(input).context("Failed to deserialize patch")
}

pub fn write_patch<W: Write>(out: &mut W, diff: DirectoryDiff) -> Result<()> {
    let manifest = PatchManifest {
        version: FORMAT_VERSION,
        diff,
    };
    write_container(out, DIR_MAGIC, &manifest)
}

pub fn read_patch<R: Read>(input: &mut R) -> Result<DirectoryDiff> {
    let manifest: PatchManifest = read_container(input, DIR_MAGIC)?;
    check_version(manifest.version)?;
    Ok(manifest.diff)
}

pub fn write_file_diff<W: Write>(out: &mut W, manifest: &FileDiffManifest) -> Result<()> {
    write_container(out, FILE_MAGIC, manifest)
}

pub fn read_file_diff<R: Read>(input: &mut R) -> Result<FileDiffManifest> {
    let manifest: FileDiffManifest = read_container(input, FILE_MAGIC)?;
    check_version(manifest.version)?;
    Ok(manifest)
}

fn check_version(version: u32) -> Result<()> {
    if version != FORMAT_VERSION {
        bail!(
            "Unsupported patch version: {} (expected {})",
            version,
            FORMAT_VERSION
        );
    }
    Ok(())
}
