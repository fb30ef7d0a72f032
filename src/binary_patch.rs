use log::warn;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{PatchError, PatchResult};
use crate::patch_format::Operation;

/// Copy ranges are streamed through a buffer of this size, whatever the file size.
pub const COPY_BUF_SIZE: usize = 64 * 1024;

/// Shared flag checked before each operation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PatchOptions {
    /// Fail on an operation that starts past the bytes written so far instead of
    /// zero-filling the hole.
    pub strict_offsets: bool,
    pub cancel: Option<CancelToken>,
}

impl PatchOptions {
    pub fn strict() -> Self {
        Self {
            strict_offsets: true,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub(crate) fn check_cancel(&self) -> PatchResult<()> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(PatchError::Cancelled),
            _ => Ok(()),
        }
    }
}

/// Stream the new content described by `ops` into `out`, reading copied ranges from `old`.
///
/// `ops` must be in ascending new offset. Deletes are skipped. Returns the number of bytes
/// written.
pub fn write_ops<R, W>(
    old: &mut R,
    ops: &[Operation],
    out: &mut W,
    options: &PatchOptions,
) -> PatchResult<u64>
where
    R: Read + Seek,
    W: Write,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut cursor: u64 = 0;

    for op in ops {
        options.check_cancel()?;
        match op {
            Operation::Delete { .. } => {}
            Operation::CreateFile { .. } | Operation::DeleteFile { .. } => {
                return Err(PatchError::UnsupportedOperation(op.kind()));
            }
            Operation::Insert { new_offset, data } => {
                let skip = align(&mut cursor, *new_offset, out, options)?;
                let skip = skip.min(data.len() as u64) as usize;
                out.write_all(&data[skip..])?;
                cursor += (data.len() - skip) as u64;
            }
            Operation::Copy {
                old_offset,
                new_offset,
                length,
            } => {
                let skip = align(&mut cursor, *new_offset, out, options)?.min(*length);
                let start = old_offset
                    .checked_add(skip)
                    .ok_or(PatchError::RangeOverflow {
                        old_offset: *old_offset,
                        length: *length,
                    })?;
                copy_range(old, out, start, length - skip, &mut buf)?;
                cursor += length - skip;
            }
        }
    }

    Ok(cursor)
}

/// Bring the cursor to `new_offset`. A hole is zero-filled (or rejected in strict mode);
/// returns how many leading bytes of the operation were already written.
fn align<W: Write>(
    cursor: &mut u64,
    new_offset: u64,
    out: &mut W,
    options: &PatchOptions,
) -> PatchResult<u64> {
    if new_offset <= *cursor {
        return Ok(*cursor - new_offset);
    }
    if options.strict_offsets {
        return Err(PatchError::OffsetGap {
            expected: *cursor,
            found: new_offset,
        });
    }
    let gap = new_offset - *cursor;
    warn!("operation list skips {} bytes at offset {}, zero-filling", gap, *cursor);
    io::copy(&mut io::repeat(0).take(gap), out)?;
    *cursor = new_offset;
    Ok(0)
}

fn copy_range<R, W>(
    old: &mut R,
    out: &mut W,
    offset: u64,
    length: u64,
    buf: &mut [u8],
) -> PatchResult<()>
where
    R: Read + Seek,
    W: Write,
{
    if length == 0 {
        return Ok(());
    }
    old.seek(SeekFrom::Start(offset))?;
    let mut remaining = length;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        old.read_exact(&mut buf[..want]).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => PatchError::UnexpectedEof {
                old_offset: offset,
                length,
            },
            _ => PatchError::Io(e),
        })?;
        out.write_all(&buf[..want])?;
        remaining -= want as u64;
    }
    Ok(())
}

/// Rebuild into memory.
pub fn apply_to_vec(old: &[u8], ops: &[Operation], options: &PatchOptions) -> PatchResult<Vec<u8>> {
    // Lengths come from the patch; reserve at most what old content and literals can supply.
    let expected = ops
        .iter()
        .fold(0u64, |acc, op| acc.saturating_add(op.new_len()));
    let inserted: u64 = ops
        .iter()
        .filter_map(|op| match op {
            Operation::Insert { data, .. } => Some(data.len() as u64),
            _ => None,
        })
        .sum();
    let bound = (old.len() as u64).saturating_add(inserted);
    let mut out = Vec::with_capacity(expected.min(bound) as usize);
    write_ops(&mut Cursor::new(old), ops, &mut out, options)?;
    Ok(out)
}

/// Rebuild into an anonymous temp file, rewound and ready to be copied out.
pub fn apply_staged<R: Read + Seek>(
    old: &mut R,
    ops: &[Operation],
    options: &PatchOptions,
) -> PatchResult<File> {
    let mut staged = tempfile::tempfile()?;
    {
        let mut writer = BufWriter::new(&mut staged);
        write_ops(old, ops, &mut writer, options)?;
        writer.flush()?;
    }
    staged.seek(SeekFrom::Start(0))?;
    Ok(staged)
}

/// Rebuild and stream the result once into a writer that cannot seek.
/// Nothing reaches `out` unless the whole operation list applied.
pub fn apply_to_writer<R, W>(
    old: &mut R,
    ops: &[Operation],
    out: &mut W,
    options: &PatchOptions,
) -> PatchResult<u64>
where
    R: Read + Seek,
    W: Write,
{
    let mut staged = apply_staged(old, ops, options)?;
    let written = io::copy(&mut staged, out)?;
    out.flush()?;
    Ok(written)
}

/// Rebuild, then truncate `dest` and copy the staged result into it as the last step.
pub fn apply_to_file<R: Read + Seek>(
    old: &mut R,
    ops: &[Operation],
    dest: &mut File,
    options: &PatchOptions,
) -> PatchResult<u64> {
    let staged = apply_staged(old, ops, options)?;
    commit_staged(staged, dest)
}

/// Patch a file using its own current bytes as the old content.
pub fn patch_file_in_place(path: &Path, ops: &[Operation], options: &PatchOptions) -> PatchResult<u64> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let staged = apply_staged(&mut file, ops, options)?;
    commit_staged(staged, &mut file)
}

/// Truncate `dest` and copy a staged result into it.
pub fn commit_staged(mut staged: File, dest: &mut File) -> PatchResult<u64> {
    dest.seek(SeekFrom::Start(0))?;
    dest.set_len(0)?;
    let written = io::copy(&mut staged, dest)?;
    dest.flush()?;
    Ok(written)
}
