//! Block-anchor binary diff and patch for files and directory trees.
//!
//! - [`binary_diff`]: multi-pass anchor matcher, operation compiler, diff strategies
//! - [`binary_patch`]: streaming, staged patch applier
//! - [`create`] / [`apply`]: directory-level diff and apply
//! - [`patch_format`]: operation model and the on-disk patch container

pub mod apply;
pub mod binary_diff;
pub mod binary_patch;
pub mod block_index;
pub mod config;
pub mod create;
pub mod error;
pub mod patch_format;
pub mod rolling_hash;
pub mod util;

pub use binary_diff::{diff_bytes, diff_files, diff_readers, AnchorMatcher, DiffStrategy, LcsDiff};
pub use binary_patch::{apply_to_vec, CancelToken, PatchOptions};
pub use config::{DiffConfig, MatchPass};
pub use error::PatchError;
pub use patch_format::{Change, DirectoryDiff, FileDiff, Operation};
