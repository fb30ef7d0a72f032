use std::collections::HashMap;

use crate::rolling_hash::block_hash;

/// Hash index over the non-overlapping `block_size` blocks of the old content.
///
/// Blocks start at `0, B, 2B, ...`; a trailing partial block is not indexed. Offsets under
/// one hash are kept in ascending order.
pub struct BlockIndex {
    table: HashMap<u32, Vec<usize>>,
}

impl BlockIndex {
    pub fn build(old: &[u8], block_size: usize) -> Self {
        let num_blocks = if block_size == 0 { 0 } else { old.len() / block_size };
        let mut table: HashMap<u32, Vec<usize>> = HashMap::with_capacity(num_blocks);
        for (i, block) in old.chunks_exact(block_size.max(1)).take(num_blocks).enumerate() {
            table.entry(block_hash(block)).or_default().push(i * block_size);
        }
        Self { table }
    }

    /// Old offsets whose block hashes to `hash`, ascending.
    pub fn candidates(&self, hash: u32) -> &[usize] {
        self.table.get(&hash).map(Vec::as_slice).unwrap_or(&[])
    }
}
