//! Block extents and the helpers that build, slice and flatten lists of them.
//!
//! An extent list is read as the *logical concatenation* of its extents: the
//! first block of the second extent immediately follows the last block of the
//! first one, whatever the physical gap between them. [`extents_sublist`]
//! works in that logical space.

use std::fmt;

/// Start block reserved for sparse holes: ranges with no physical backing.
pub const SPARSE_HOLE: u64 = u64::MAX;

/// A contiguous run of `num_blocks` blocks starting at `start_block`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Extent {
    pub start_block: u64,
    pub num_blocks: u64,
}

impl Extent {
    pub const fn new(start_block: u64, num_blocks: u64) -> Self {
        Self {
            start_block,
            num_blocks,
        }
    }

    pub const fn is_hole(&self) -> bool {
        self.start_block == SPARSE_HOLE
    }

    /// One past the last block. Meaningless for holes.
    pub const fn end_block(&self) -> u64 {
        self.start_block.saturating_add(self.num_blocks)
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_hole() {
            write!(f, "[hole, {}]", self.num_blocks)
        } else {
            write!(f, "[{}, {}]", self.start_block, self.num_blocks)
        }
    }
}

/// Byte-addressed range, used for deflate streams rounded to whole bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteExtent {
    pub offset: u64,
    pub length: u64,
}

impl ByteExtent {
    pub const fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    pub const fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Bit-addressed location of one deflate stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BitExtent {
    pub offset: u64,
    pub length: u64,
}

impl BitExtent {
    pub const fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    pub const fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Smallest byte range enclosing this bit range.
    pub const fn to_byte_extent(&self) -> ByteExtent {
        let start = self.offset / 8;
        let end = self.end().div_ceil(8);
        ByteExtent::new(start, end - start)
    }
}

impl From<ByteExtent> for BitExtent {
    fn from(extent: ByteExtent) -> Self {
        Self::new(extent.offset * 8, extent.length * 8)
    }
}

/// Extends the last extent of `extents` when `block` continues it, otherwise
/// starts a new one-block extent. A hole continues a hole.
pub fn append_block_to_extents(extents: &mut Vec<Extent>, block: u64) {
    if let Some(last) = extents.last_mut() {
        let contiguous = if last.is_hole() {
            block == SPARSE_HOLE
        } else {
            block != SPARSE_HOLE && last.start_block.checked_add(last.num_blocks) == Some(block)
        };
        if contiguous {
            last.num_blocks += 1;
            return;
        }
    }
    extents.push(Extent::new(block, 1));
}

/// Coalesces touching neighbours of an ordered extent list and drops empty
/// extents. Holes only merge with holes.
pub fn normalize_extents(extents: &mut Vec<Extent>) {
    let mut normalized: Vec<Extent> = Vec::with_capacity(extents.len());
    for &extent in extents.iter().filter(|e| e.num_blocks > 0) {
        match normalized.last_mut() {
            Some(last)
                if (last.is_hole() && extent.is_hole())
                    || (!last.is_hole() && !extent.is_hole() && last.end_block() == extent.start_block) =>
            {
                last.num_blocks += extent.num_blocks;
            }
            _ => normalized.push(extent),
        }
    }
    *extents = normalized;
}

/// Returns the extents covering logical blocks
/// `[block_offset, block_offset + block_count)` of `extents`.
///
/// If `extents` is shorter than requested the result is truncated, possibly
/// to nothing.
pub fn extents_sublist(extents: &[Extent], block_offset: u64, block_count: u64) -> Vec<Extent> {
    let mut result = Vec::new();
    if block_count == 0 {
        return result;
    }
    let end_offset = block_offset + block_count;
    let mut scanned = 0u64;
    for extent in extents {
        if scanned + extent.num_blocks > block_offset {
            let mut start = extent.start_block;
            let mut num_blocks = extent.num_blocks;
            if scanned + num_blocks > end_offset {
                num_blocks = end_offset - scanned;
            }
            if block_offset > scanned {
                let cut = block_offset - scanned;
                num_blocks -= cut;
                if !extent.is_hole() {
                    start += cut;
                }
            }
            result.push(Extent::new(start, num_blocks));
        }
        scanned += extent.num_blocks;
        if scanned >= end_offset {
            break;
        }
    }
    result
}

/// Flattens `extents` into the list of block numbers they cover, in order.
pub fn expand_extents(extents: &[Extent]) -> Vec<u64> {
    let mut blocks = Vec::with_capacity(blocks_in_extents(extents) as usize);
    for extent in extents {
        if extent.is_hole() {
            blocks.extend(std::iter::repeat_n(SPARSE_HOLE, extent.num_blocks as usize));
        } else {
            blocks.extend(extent.start_block..extent.end_block());
        }
    }
    blocks
}

/// `extents` minus its holes. A hole has nothing to write and no block to
/// read from, so operations never carry one.
pub fn without_holes(extents: &[Extent]) -> Vec<Extent> {
    extents.iter().filter(|e| !e.is_hole()).copied().collect()
}

pub fn blocks_in_extents(extents: &[Extent]) -> u64 {
    extents.iter().map(|e| e.num_blocks).sum()
}

pub fn extents_to_string(extents: &[Extent]) -> String {
    extents
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}
