use std::io;

/// Failures of the byte-level patch applier.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The old content ended inside a range a `Copy` claims. The operation list does not
    /// belong to this old content.
    #[error("old content ended while copying {length} bytes from offset {old_offset}")]
    UnexpectedEof { old_offset: u64, length: u64 },

    #[error("copy of {length} bytes from offset {old_offset} runs past the addressable range")]
    RangeOverflow { old_offset: u64, length: u64 },

    #[error("operation starts at new offset {found} but {expected} bytes were written")]
    OffsetGap { expected: u64, found: u64 },

    #[error("{0} operations cannot be applied to file content")]
    UnsupportedOperation(&'static str),

    #[error("patch cancelled")]
    Cancelled,
}

pub type PatchResult<T> = Result<T, PatchError>;
