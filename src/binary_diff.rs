use anyhow::{Context, Result};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use tempfile::NamedTempFile;

use crate::block_index::BlockIndex;
use crate::config::{DiagnosticConfig, DiffConfig, MatchPass};
use crate::patch_format::{FileDiff, Operation};
use crate::rolling_hash::RollingHash;
use crate::util;

/// A copyable region, keyed by its new offset in a [`MatchSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub old_offset: usize,
    pub length: usize,
}

/// Accepted matches ordered by new offset, mirrored by old offset so that overlap checks in
/// both spaces are predecessor/successor lookups.
#[derive(Debug, Default)]
pub struct MatchSet {
    by_new: BTreeMap<usize, Match>,
    by_old: BTreeMap<usize, usize>,
}

/// Free interval `[lo, hi)` around `pos` in a start -> length map, or `None` if `pos` is
/// covered by an entry.
fn gap_around(starts: &BTreeMap<usize, usize>, pos: usize, limit: usize) -> Option<(usize, usize)> {
    let lo = match starts.range(..=pos).next_back() {
        Some((&start, &len)) if start + len > pos => return None,
        Some((&start, &len)) => start + len,
        None => 0,
    };
    let hi = starts
        .range(pos + 1..)
        .next()
        .map_or(limit, |(&start, _)| start.min(limit));
    Some((lo, hi))
}

impl MatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_new.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_new.is_empty()
    }

    /// Matches in ascending new offset.
    pub fn iter(&self) -> impl Iterator<Item = (usize, Match)> + '_ {
        self.by_new.iter().map(|(&new_offset, &m)| (new_offset, m))
    }

    /// Copied old ranges as `(old_offset, length)`, ascending.
    pub fn old_ranges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.by_old.iter().map(|(&offset, &length)| (offset, length))
    }

    fn free_new_gap(&self, pos: usize, limit: usize) -> Option<(usize, usize)> {
        let lo = match self.by_new.range(..=pos).next_back() {
            Some((&start, m)) if start + m.length > pos => return None,
            Some((&start, m)) => start + m.length,
            None => 0,
        };
        let hi = self
            .by_new
            .range(pos + 1..)
            .next()
            .map_or(limit, |(&start, _)| start.min(limit));
        Some((lo, hi))
    }

    fn free_old_gap(&self, pos: usize, limit: usize) -> Option<(usize, usize)> {
        gap_around(&self.by_old, pos, limit)
    }

    /// End of the accepted new range containing `pos`, if any.
    fn covering_new_end(&self, pos: usize) -> Option<usize> {
        self.by_new
            .range(..=pos)
            .next_back()
            .map(|(&start, m)| start + m.length)
            .filter(|&end| end > pos)
    }

    /// Record a match unless it overlaps an accepted one in either space.
    pub fn insert(&mut self, new_offset: usize, m: Match) -> bool {
        if m.length == 0 {
            return false;
        }
        let fits_new = self
            .free_new_gap(new_offset, usize::MAX)
            .is_some_and(|(_, hi)| new_offset + m.length <= hi);
        let fits_old = self
            .free_old_gap(m.old_offset, usize::MAX)
            .is_some_and(|(_, hi)| m.old_offset + m.length <= hi);
        if !(fits_new && fits_old) {
            return false;
        }
        self.by_new.insert(new_offset, m);
        self.by_old.insert(m.old_offset, m.length);
        true
    }
}

/// Interchangeable ways of describing the edit from `old` to `new`.
pub trait DiffStrategy: Send + Sync {
    fn diff(&self, old: &[u8], new: &[u8]) -> FileDiff;
}

/// Multi-pass block-anchor matcher.
///
/// Each pass indexes the old content at its block size, probes the new content every
/// `stride` bytes, verifies hash hits byte-for-byte and grows verified blocks to their
/// maximal extent inside the surrounding free gap. Earlier passes are never revisited;
/// later passes only fill what is left.
#[derive(Debug, Clone, Default)]
pub struct AnchorMatcher {
    config: DiffConfig,
}

impl AnchorMatcher {
    pub fn new(config: DiffConfig) -> Self {
        Self { config }
    }

    pub fn find_matches(&self, old: &[u8], new: &[u8]) -> MatchSet {
        let mut matches = MatchSet::new();
        for pass in self.config.effective_passes() {
            let accepted = run_pass(old, new, pass, &mut matches);
            debug!(
                "pass {}/{}: {} new matches, {} total",
                pass.block_size,
                pass.stride,
                accepted,
                matches.len()
            );
        }
        matches
    }
}

impl DiffStrategy for AnchorMatcher {
    fn diff(&self, old: &[u8], new: &[u8]) -> FileDiff {
        if !old.is_empty() && old == new {
            return FileDiff::new(vec![Operation::Copy {
                old_offset: 0,
                new_offset: 0,
                length: old.len() as u64,
            }]);
        }
        let matches = self.find_matches(old, new);
        compile(&matches, new, old.len())
    }
}

fn run_pass(old: &[u8], new: &[u8], pass: &MatchPass, matches: &mut MatchSet) -> usize {
    let block = pass.block_size;
    if old.len() < block || new.len() < block {
        return 0;
    }

    let index = BlockIndex::build(old, block);
    let mut accepted = 0;
    let mut pos = 0;
    let mut hash: Option<RollingHash> = None;

    while pos + block <= new.len() {
        if let Some(end) = matches.covering_new_end(pos) {
            pos = end;
            hash = None;
            continue;
        }

        let digest = hash
            .get_or_insert_with(|| RollingHash::of(&new[pos..pos + block]))
            .digest();
        let candidates = index.candidates(digest);

        if let Some((new_start, m)) = best_extension(old, new, pos, pass, candidates, matches) {
            let inserted = matches.insert(new_start, m);
            debug_assert!(inserted, "extension escaped its free gap");
            accepted += 1;
            pos = new_start + m.length;
            hash = None;
            continue;
        }

        let next = pos + pass.stride;
        if next + block > new.len() {
            break;
        }
        if pass.stride < block {
            if let Some(h) = hash.as_mut() {
                h.slide(new, pos, pass.stride, block);
            }
        } else {
            hash = None;
        }
        pos = next;
    }

    accepted
}

/// Longest verified, non-overlapping extension of the anchor at `pos`.
/// Ties keep the lowest old offset.
fn best_extension(
    old: &[u8],
    new: &[u8],
    pos: usize,
    pass: &MatchPass,
    candidates: &[usize],
    matches: &MatchSet,
) -> Option<(usize, Match)> {
    let block = pass.block_size;
    let (new_lo, new_hi) = matches.free_new_gap(pos, new.len())?;
    if new_hi < pos + block {
        return None;
    }
    let window = &new[pos..pos + block];

    let mut best: Option<(usize, Match)> = None;
    for &old_pos in candidates.iter().take(pass.max_candidates) {
        if &old[old_pos..old_pos + block] != window {
            continue;
        }
        let Some((old_lo, old_hi)) = matches.free_old_gap(old_pos, old.len()) else {
            continue;
        };
        if old_hi < old_pos + block {
            continue;
        }

        let back_limit = (pos - new_lo).min(old_pos - old_lo);
        let back = old[old_pos - back_limit..old_pos]
            .iter()
            .rev()
            .zip(new[pos - back_limit..pos].iter().rev())
            .take_while(|(a, b)| a == b)
            .count();

        let fwd_limit = (new_hi - pos - block).min(old_hi - old_pos - block);
        let fwd = old[old_pos + block..old_pos + block + fwd_limit]
            .iter()
            .zip(&new[pos + block..pos + block + fwd_limit])
            .take_while(|(a, b)| a == b)
            .count();

        let length = back + block + fwd;
        if best.map_or(true, |(_, m)| length > m.length) {
            best = Some((
                pos - back,
                Match {
                    old_offset: old_pos - back,
                    length,
                },
            ));
        }
        if pos - back == new_lo && pos + block + fwd == new_hi {
            // Fills the whole gap; nothing can beat it.
            break;
        }
    }

    best
}

/// Turn a match set into the merged operation list covering all of `new`.
pub fn compile(matches: &MatchSet, new: &[u8], old_len: usize) -> FileDiff {
    let mut ops = Vec::with_capacity(matches.len() * 2 + 2);

    let mut cursor = 0;
    for (new_offset, m) in matches.iter() {
        if cursor < new_offset {
            ops.push(Operation::Insert {
                new_offset: cursor as u64,
                data: new[cursor..new_offset].to_vec(),
            });
        }
        ops.push(Operation::Copy {
            old_offset: m.old_offset as u64,
            new_offset: new_offset as u64,
            length: m.length as u64,
        });
        cursor = new_offset + m.length;
    }
    if cursor < new.len() {
        ops.push(Operation::Insert {
            new_offset: cursor as u64,
            data: new[cursor..].to_vec(),
        });
    }

    let mut old_cursor = 0;
    for (old_offset, length) in matches.old_ranges() {
        if old_cursor < old_offset {
            ops.push(Operation::Delete {
                old_offset: old_cursor as u64,
                length: (old_offset - old_cursor) as u64,
            });
        }
        old_cursor = old_offset + length;
    }
    if old_cursor < old_len {
        ops.push(Operation::Delete {
            old_offset: old_cursor as u64,
            length: (old_len - old_cursor) as u64,
        });
    }

    let ops = merge_ops(ops);
    check_totals(&ops, old_len as u64, new.len() as u64);
    FileDiff::new(ops)
}

fn check_totals(ops: &[Operation], old_len: u64, new_len: u64) {
    let (mut inserted, mut copied, mut deleted) = (0u64, 0u64, 0u64);
    for op in ops {
        match op {
            Operation::Insert { data, .. } => inserted += data.len() as u64,
            Operation::Copy { length, .. } => copied += length,
            Operation::Delete { length, .. } => deleted += length,
            _ => {}
        }
    }
    if inserted + copied != new_len || copied + deleted != old_len {
        warn!(
            "diff totals disagree: insert {} + copy {} vs new {}, copy {} + delete {} vs old {}",
            inserted, copied, new_len, copied, deleted, old_len
        );
    }
}

fn merge_rank(op: &Operation) -> (u8, u64) {
    match op {
        Operation::Copy { new_offset, .. } | Operation::Insert { new_offset, .. } => {
            (0, *new_offset)
        }
        Operation::Delete { old_offset, .. } => (1, *old_offset),
        Operation::CreateFile { .. } | Operation::DeleteFile { .. } => (2, 0),
    }
}

/// Fuse `next` into `last` when they are contiguous. Returns whether it was absorbed.
fn fuse(last: &mut Operation, next: &Operation) -> bool {
    match (last, next) {
        (
            Operation::Insert { new_offset, data },
            Operation::Insert {
                new_offset: next_offset,
                data: next_data,
            },
        ) => {
            if *new_offset + data.len() as u64 != *next_offset {
                return false;
            }
            data.extend_from_slice(next_data);
            true
        }
        (
            Operation::Copy {
                old_offset,
                new_offset,
                length,
            },
            Operation::Copy {
                old_offset: next_old,
                new_offset: next_new,
                length: next_length,
            },
        ) => {
            if *old_offset + *length != *next_old || *new_offset + *length != *next_new {
                return false;
            }
            *length += next_length;
            true
        }
        (
            Operation::Delete { old_offset, length },
            Operation::Delete {
                old_offset: next_old,
                length: next_length,
            },
        ) => {
            if *old_offset + *length != *next_old {
                return false;
            }
            *length += next_length;
            true
        }
        _ => false,
    }
}

/// Order Insert/Copy by new offset, Deletes after them by old offset, and fuse neighbours.
pub fn merge_ops(mut ops: Vec<Operation>) -> Vec<Operation> {
    ops.sort_by_key(merge_rank);
    let mut merged: Vec<Operation> = Vec::with_capacity(ops.len());
    for op in ops {
        if let Some(last) = merged.last_mut() {
            if fuse(last, &op) {
                continue;
            }
        }
        merged.push(op);
    }
    merged
}

/// Exact byte-level LCS. Quadratic, so inputs whose table would exceed `max_cells` go to the
/// fallback matcher instead.
#[derive(Debug, Clone)]
pub struct LcsDiff {
    max_cells: usize,
    fallback: AnchorMatcher,
}

impl LcsDiff {
    pub const DEFAULT_MAX_CELLS: usize = 4 * 1024 * 1024;

    pub fn new(max_cells: usize, fallback: AnchorMatcher) -> Self {
        Self {
            max_cells,
            fallback,
        }
    }
}

impl Default for LcsDiff {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_CELLS, AnchorMatcher::default())
    }
}

impl DiffStrategy for LcsDiff {
    fn diff(&self, old: &[u8], new: &[u8]) -> FileDiff {
        let cells = (old.len() + 1).saturating_mul(new.len() + 1);
        if cells > self.max_cells {
            debug!("lcs table of {} cells over limit, using anchor matcher", cells);
            return self.fallback.diff(old, new);
        }
        compile(&lcs_matches(old, new), new, old.len())
    }
}

fn lcs_matches(old: &[u8], new: &[u8]) -> MatchSet {
    let (n, m) = (old.len(), new.len());
    let width = m + 1;
    // table[i * width + j] = LCS length of old[i..] and new[j..]
    let mut table = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i * width + j] = if old[i] == new[j] {
                table[(i + 1) * width + j + 1] + 1
            } else {
                table[(i + 1) * width + j].max(table[i * width + j + 1])
            };
        }
    }

    let mut matches = MatchSet::new();
    let mut run: Option<(usize, Match)> = None;
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            run = match run {
                Some((start, mut r)) => {
                    r.length += 1;
                    Some((start, r))
                }
                None => Some((
                    j,
                    Match {
                        old_offset: i,
                        length: 1,
                    },
                )),
            };
            i += 1;
            j += 1;
            continue;
        }
        if let Some((start, r)) = run.take() {
            matches.insert(start, r);
        }
        if table[(i + 1) * width + j] >= table[i * width + j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    if let Some((start, r)) = run {
        matches.insert(start, r);
    }
    matches
}

/// Diff two in-memory buffers with the anchor matcher.
pub fn diff_bytes(old: &[u8], new: &[u8], config: &DiffConfig) -> FileDiff {
    AnchorMatcher::new(config.clone()).diff(old, new)
}

/// Diff two files on disk. Both are memory-mapped for random access.
pub fn diff_files(old: &Path, new: &Path, strategy: &dyn DiffStrategy) -> Result<FileDiff> {
    let old_data = util::mmap_file(old)?;
    let new_data = util::mmap_file(new)?;
    Ok(strategy.diff(&old_data, &new_data))
}

const STAGE_LABELS: [&str; 2] = ["old", "new"];

/// Diff two arbitrary readers.
///
/// Both are copied into private temp files first so the matcher gets random access even when
/// the sources are pipes. The staging files are removed afterwards, except that a failure in
/// diagnostic mode keeps copies of them for inspection.
pub fn diff_readers<O: Read, N: Read>(old: O, new: N, config: &DiffConfig) -> Result<FileDiff> {
    let mut staged: Vec<NamedTempFile> = Vec::with_capacity(2);
    let result = stage_and_diff(old, new, config, &mut staged);
    if result.is_err() && config.diagnostics.enabled {
        preserve_staging(&staged, &config.diagnostics);
    }
    result
}

fn stage_and_diff<O: Read, N: Read>(
    mut old: O,
    mut new: N,
    config: &DiffConfig,
    staged: &mut Vec<NamedTempFile>,
) -> Result<FileDiff> {
    stage_into(&mut old, staged).context("Failed to stage old content")?;
    stage_into(&mut new, staged).context("Failed to stage new content")?;

    let old_data = util::map_open_file(staged[0].as_file())?;
    let new_data = util::map_open_file(staged[1].as_file())?;
    Ok(AnchorMatcher::new(config.clone()).diff(&old_data, &new_data))
}

fn stage_into(reader: &mut dyn Read, staged: &mut Vec<NamedTempFile>) -> Result<()> {
    let mut file = NamedTempFile::new().context("Failed to create staging file")?;
    let copied = std::io::copy(reader, &mut file);
    staged.push(file);
    copied.context("Failed to copy source into staging file")?;
    Ok(())
}

fn preserve_staging(staged: &[NamedTempFile], diagnostics: &DiagnosticConfig) {
    let dir = diagnostics
        .preserve_dir
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    let _ = std::fs::create_dir_all(&dir);
    for (file, label) in staged.iter().zip(STAGE_LABELS) {
        let target = dir.join(format!("treedelta-{}-{}.bin", std::process::id(), label));
        match std::fs::copy(file.path(), &target) {
            Ok(_) => warn!("kept staged {} content at {}", label, target.display()),
            Err(e) => warn!("could not keep staged {} content: {}", label, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary_patch::{apply_to_vec, PatchOptions};

    /// xorshift64 bytes; different seeds share no long substrings.
    fn pattern(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 24) as u8
            })
            .collect()
    }

    fn round_trip(old: &[u8], new: &[u8]) -> FileDiff {
        let diff = diff_bytes(old, new, &DiffConfig::default());
        let rebuilt = apply_to_vec(old, diff.ops(), &PatchOptions::default()).unwrap();
        assert_eq!(rebuilt, new);
        diff
    }

    #[test]
    fn test_append_example() {
        let old = vec![0x41u8; 2000];
        let mut new = old.clone();
        new.extend_from_slice(&[0x5A; 10]);

        let diff = round_trip(&old, &new);
        assert_eq!(
            diff.ops(),
            &[
                Operation::Copy {
                    old_offset: 0,
                    new_offset: 0,
                    length: 2000
                },
                Operation::Insert {
                    new_offset: 2000,
                    data: vec![0x5A; 10]
                },
            ]
        );
    }

    #[test]
    fn test_identical_data() {
        for len in [1, 13, 1024, 5000] {
            let data = pattern(len, 3);
            let diff = round_trip(&data, &data);
            assert_eq!(
                diff.ops(),
                &[Operation::Copy {
                    old_offset: 0,
                    new_offset: 0,
                    length: len as u64
                }]
            );
        }
    }

    #[test]
    fn test_completely_different() {
        let old = vec![0u8; 3000];
        let new = vec![1u8; 2500];
        let diff = round_trip(&old, &new);
        assert_eq!(
            diff.ops(),
            &[
                Operation::Insert {
                    new_offset: 0,
                    data: new.clone()
                },
                Operation::Delete {
                    old_offset: 0,
                    length: 3000
                },
            ]
        );
    }

    #[test]
    fn test_append_only() {
        let old = pattern(5000, 1);
        let suffix = vec![0xEE; 300];
        let mut new = old.clone();
        new.extend_from_slice(&suffix);
        let diff = round_trip(&old, &new);
        assert_eq!(
            diff.ops(),
            &[
                Operation::Copy {
                    old_offset: 0,
                    new_offset: 0,
                    length: 5000
                },
                Operation::Insert {
                    new_offset: 5000,
                    data: suffix
                },
            ]
        );
    }

    #[test]
    fn test_prefix_changed() {
        let old = pattern(8192, 9);
        let mut new = old.clone();
        for b in new[..1500].iter_mut() {
            *b = !*b;
        }
        let diff = round_trip(&old, &new);
        assert!(diff.ops().contains(&Operation::Copy {
            old_offset: 1500,
            new_offset: 1500,
            length: 8192 - 1500
        }));
        assert!(diff.ops().contains(&Operation::Delete {
            old_offset: 0,
            length: 1500
        }));
    }

    #[test]
    fn test_insertion_in_middle() {
        let old = pattern(4096 * 4, 5);
        let mut new = old.clone();
        new.splice(8192..8192, vec![0xAA; 100]);
        let diff = round_trip(&old, &new);
        assert_eq!(diff.count("insert"), 1);
        assert_eq!(diff.count("delete"), 0);
        assert_eq!(diff.new_len(), new.len() as u64);
    }

    #[test]
    fn test_moved_blocks_are_copied() {
        let a = pattern(3000, 11);
        let b = pattern(3000, 77);
        let old = [a.as_slice(), b.as_slice()].concat();
        let new = [b.as_slice(), a.as_slice()].concat();
        let diff = round_trip(&old, &new);
        assert_eq!(diff.count("insert"), 0);
        assert_eq!(diff.count("copy"), 2);
    }

    #[test]
    fn test_small_edit_found_by_fine_pass() {
        let old = pattern(600, 21);
        let mut new = old.clone();
        new[300] ^= 0xFF;
        let diff = round_trip(&old, &new);
        let copied: u64 = diff
            .iter()
            .filter_map(|op| match op {
                Operation::Copy { length, .. } => Some(*length),
                _ => None,
            })
            .sum();
        assert_eq!(copied, 599);
    }

    #[test]
    fn test_empty_inputs() {
        assert!(round_trip(&[], &[]).is_empty());
        let diff = round_trip(&[], &[1u8; 100]);
        assert_eq!(diff.len(), 1);
        let diff = round_trip(&[1u8; 100], &[]);
        assert_eq!(
            diff.ops(),
            &[Operation::Delete {
                old_offset: 0,
                length: 100
            }]
        );
    }

    #[test]
    fn test_small_files() {
        round_trip(b"Hello, World!", b"Hello, Rust!");
    }

    #[test]
    fn test_match_set_rejects_overlap() {
        let mut set = MatchSet::new();
        assert!(set.insert(
            100,
            Match {
                old_offset: 0,
                length: 50
            }
        ));
        // Overlaps in new space.
        assert!(!set.insert(
            140,
            Match {
                old_offset: 500,
                length: 20
            }
        ));
        // Overlaps in old space.
        assert!(!set.insert(
            0,
            Match {
                old_offset: 49,
                length: 10
            }
        ));
        // Touching ranges are fine.
        assert!(set.insert(
            150,
            Match {
                old_offset: 50,
                length: 10
            }
        ));
        assert!(!set.insert(
            0,
            Match {
                old_offset: 0,
                length: 0
            }
        ));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_gap_lookup() {
        let mut set = MatchSet::new();
        set.insert(
            10,
            Match {
                old_offset: 100,
                length: 10,
            },
        );
        set.insert(
            40,
            Match {
                old_offset: 0,
                length: 5,
            },
        );
        assert_eq!(set.free_new_gap(25, 1000), Some((20, 40)));
        assert_eq!(set.free_new_gap(15, 1000), None);
        assert_eq!(set.free_new_gap(45, 1000), Some((45, 1000)));
        assert_eq!(set.free_old_gap(50, 1000), Some((5, 100)));
        assert_eq!(set.covering_new_end(12), Some(20));
        assert_eq!(set.covering_new_end(20), None);
    }

    #[test]
    fn test_merge_fuses_contiguous_runs() {
        let ops = vec![
            Operation::Delete {
                old_offset: 4,
                length: 2,
            },
            Operation::Insert {
                new_offset: 3,
                data: vec![3],
            },
            Operation::Copy {
                old_offset: 10,
                new_offset: 4,
                length: 4,
            },
            Operation::Insert {
                new_offset: 0,
                data: vec![0, 1, 2],
            },
            Operation::Copy {
                old_offset: 14,
                new_offset: 8,
                length: 2,
            },
            Operation::Delete {
                old_offset: 0,
                length: 4,
            },
        ];
        let merged = merge_ops(ops);
        assert_eq!(
            merged,
            vec![
                Operation::Insert {
                    new_offset: 0,
                    data: vec![0, 1, 2, 3]
                },
                Operation::Copy {
                    old_offset: 10,
                    new_offset: 4,
                    length: 6
                },
                Operation::Delete {
                    old_offset: 0,
                    length: 6
                },
            ]
        );
        assert_eq!(merge_ops(merged.clone()), merged);
    }

    #[test]
    fn test_merge_keeps_non_contiguous_copies() {
        let ops = vec![
            Operation::Copy {
                old_offset: 0,
                new_offset: 0,
                length: 4,
            },
            Operation::Copy {
                old_offset: 8,
                new_offset: 4,
                length: 4,
            },
        ];
        assert_eq!(merge_ops(ops.clone()), ops);
    }

    #[test]
    fn test_lcs_strategy() {
        let old = b"the quick brown fox";
        let new = b"the quick red fox!";
        let diff = LcsDiff::default().diff(old, new);
        let rebuilt = apply_to_vec(old, diff.ops(), &PatchOptions::default()).unwrap();
        assert_eq!(rebuilt, new);
        assert!(diff.ops().contains(&Operation::Copy {
            old_offset: 0,
            new_offset: 0,
            length: 10
        }));
    }

    #[test]
    fn test_lcs_over_limit_uses_fallback() {
        let old = vec![0x41u8; 2000];
        let mut new = old.clone();
        new.push(0x5A);
        let strategy = LcsDiff::new(16, AnchorMatcher::default());
        let diff = strategy.diff(&old, &new);
        assert_eq!(diff.len(), 2);
    }

    #[test]
    fn test_strategies_are_interchangeable() {
        let old = pattern(700, 2);
        let mut new = old.clone();
        new.splice(100..120, b"replacement".iter().copied());
        let strategies: Vec<Box<dyn DiffStrategy>> =
            vec![Box::new(AnchorMatcher::default()), Box::new(LcsDiff::default())];
        for strategy in &strategies {
            let diff = strategy.diff(&old, &new);
            let rebuilt = apply_to_vec(&old, diff.ops(), &PatchOptions::default()).unwrap();
            assert_eq!(rebuilt, new);
        }
    }

    #[test]
    fn test_diff_readers_matches_diff_bytes() {
        let old = pattern(4000, 8);
        let mut new = old.clone();
        new.truncate(3000);
        new.extend_from_slice(b"tail");
        let config = DiffConfig::default();
        let staged = diff_readers(old.as_slice(), new.as_slice(), &config).unwrap();
        assert_eq!(staged, diff_bytes(&old, &new, &config));
    }

    struct FailingReader {
        served: usize,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.served >= 100 {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "source went away"));
            }
            let n = buf.len().min(100 - self.served);
            buf[..n].fill(b'x');
            self.served += n;
            Ok(n)
        }
    }

    #[test]
    fn test_failed_stage_is_preserved_in_diagnostic_mode() {
        let dir = tempfile::tempdir().unwrap();
        let config = DiffConfig::default().with_diagnostics(Some(dir.path().to_path_buf()));
        let old = b"old bytes".to_vec();
        let result = diff_readers(old.as_slice(), FailingReader { served: 0 }, &config);
        assert!(result.is_err());

        let pid = std::process::id();
        let kept_old = std::fs::read(dir.path().join(format!("treedelta-{pid}-old.bin"))).unwrap();
        let kept_new = std::fs::read(dir.path().join(format!("treedelta-{pid}-new.bin"))).unwrap();
        assert_eq!(kept_old, old);
        assert_eq!(kept_new, vec![b'x'; 100]);
    }

    #[test]
    fn test_failed_stage_is_dropped_without_diagnostics() {
        let result = diff_readers(&b"old"[..], FailingReader { served: 0 }, &DiffConfig::default());
        assert!(result.is_err());
    }
}
