//! Deflate stream locations and their translation between coordinate systems.
//!
//! Three spaces are involved: absolute partition blocks, the logical
//! concatenation of an extent list (what a reader sees after reading the
//! extents back to back), and bit offsets of compressed streams within either
//! of those.

use rustc_hash::FxHashSet;

use crate::error::{Error, Result};
use crate::extent::{BitExtent, Extent, blocks_in_extents};

/// Maps `over`, given as logical block ranges inside the concatenation of
/// `base`, onto the physical blocks of `base`. Ranges straddling a gap between
/// two `base` extents are split at the gap.
pub fn shift_extents_over_extents(base: &[Extent], over: &[Extent]) -> Result<Vec<Extent>> {
    let base_blocks = blocks_in_extents(base);
    let over_blocks = blocks_in_extents(over);
    if over_blocks > base_blocks {
        return Err(Error::ExtentsExceedBase {
            over: over_blocks,
            base: base_blocks,
        });
    }

    let mut shifted = Vec::with_capacity(over.len());
    for extent in over {
        let end = extent.start_block + extent.num_blocks;
        if end > base_blocks {
            return Err(Error::ExtentsExceedBase {
                over: end,
                base: base_blocks,
            });
        }
        let mut start = extent.start_block;
        let mut remaining = extent.num_blocks;
        let mut logical = 0;
        for b in base {
            if remaining == 0 {
                break;
            }
            let logical_end = logical + b.num_blocks;
            if start < logical_end {
                let within = start - logical;
                let taken = remaining.min(b.num_blocks - within);
                let physical = if b.is_hole() {
                    b.start_block
                } else {
                    b.start_block + within
                };
                shifted.push(Extent::new(physical, taken));
                start += taken;
                remaining -= taken;
            }
            logical = logical_end;
        }
    }
    Ok(shifted)
}

/// Maps deflate locations given as bit offsets into the concatenation of
/// `base` onto absolute bit offsets in the partition. A stream cannot be split,
/// so one that straddles a gap between two `base` extents is dropped, and so is
/// one inside a hole, which has no physical location.
pub fn shift_bit_extents_over_extents(
    base: &[Extent],
    over: &[BitExtent],
    block_size: u64,
) -> Result<Vec<BitExtent>> {
    let Some(last) = over.iter().map(|e| e.to_byte_extent().end()).max() else {
        return Ok(Vec::new());
    };
    let base_bytes = blocks_in_extents(base) * block_size;
    if last > base_bytes {
        return Err(Error::ExtentsExceedBase {
            over: last,
            base: base_bytes,
        });
    }

    let mut shifted = Vec::with_capacity(over.len());
    for deflate in over {
        let mut logical_bits = 0;
        for b in base {
            let extent_bits = b.num_blocks * block_size * 8;
            if deflate.offset < logical_bits + extent_bits {
                if deflate.end() <= logical_bits + extent_bits && !b.is_hole() {
                    let physical_bits = b
                        .start_block
                        .checked_mul(block_size * 8)
                        .ok_or_else(|| Error::InvalidExtents(format!("extent {b} is beyond addressable bits")))?;
                    shifted.push(BitExtent::new(
                        deflate.offset - logical_bits + physical_bits,
                        deflate.length,
                    ));
                }
                break;
            }
            logical_bits += extent_bits;
        }
    }
    Ok(shifted)
}

/// Returns the deflates lying entirely inside one of `extents`, in input
/// order.
pub fn find_deflates(extents: &[Extent], deflates: &[BitExtent], block_size: u64) -> Vec<BitExtent> {
    deflates
        .iter()
        .filter(|deflate| extents.iter().any(|e| contains_deflate(e, deflate, block_size)))
        .copied()
        .collect()
}

fn contains_deflate(extent: &Extent, deflate: &BitExtent, block_size: u64) -> bool {
    if extent.is_hole() {
        return false;
    }
    let start_bits = extent.start_block * block_size * 8;
    let end_bits = extent.end_block() * block_size * 8;
    deflate.offset >= start_bits && deflate.end() <= end_bits
}

/// Re-expresses absolute `deflates` as offsets into the buffer produced by
/// reading `extents` back to back. Every deflate must lie inside one extent,
/// and the result must come out ordered and non-overlapping.
pub fn compact_deflates(
    extents: &[Extent],
    deflates: &[BitExtent],
    block_size: u64,
) -> Result<Vec<BitExtent>> {
    let mut compacted = Vec::with_capacity(deflates.len());
    let mut bytes_so_far = 0;
    for extent in extents {
        for deflate in deflates {
            if contains_deflate(extent, deflate, block_size) {
                let base_bits = extent.start_block * block_size * 8;
                compacted.push(BitExtent::new(
                    deflate.offset - base_bits + bytes_so_far * 8,
                    deflate.length,
                ));
            }
        }
        bytes_so_far += extent.num_blocks * block_size;
    }

    if compacted.len() != deflates.len() {
        return Err(Error::InvalidExtents(format!(
            "{} of {} deflates lie outside the extents",
            deflates.len().saturating_sub(compacted.len()),
            deflates.len()
        )));
    }
    if let Some(pair) = compacted.windows(2).find(|w| w[0].end() > w[1].offset) {
        return Err(Error::UnorderedDeflates(pair[1].offset));
    }
    Ok(compacted)
}

pub fn find_and_compact_deflates(
    extents: &[Extent],
    deflates: &[BitExtent],
    block_size: u64,
) -> Result<Vec<BitExtent>> {
    let found = find_deflates(extents, deflates, block_size);
    compact_deflates(extents, &found, block_size)
}

/// Removes the deflates whose content appears, bit aligned the same way, on
/// both sides. Diffing them again would gain nothing.
pub fn remove_equal_bit_extents(
    old_data: &[u8],
    new_data: &[u8],
    old_deflates: &mut Vec<BitExtent>,
    new_deflates: &mut Vec<BitExtent>,
) {
    fn key<'a>(data: &'a [u8], deflate: &BitExtent) -> Option<(u64, u64, &'a [u8])> {
        let bytes = deflate.to_byte_extent();
        let slice = data.get(bytes.offset as usize..bytes.end() as usize)?;
        Some((deflate.offset % 8, deflate.length, slice))
    }

    let old_keys: FxHashSet<_> = old_deflates.iter().filter_map(|d| key(old_data, d)).collect();
    let new_keys: FxHashSet<_> = new_deflates.iter().filter_map(|d| key(new_data, d)).collect();

    old_deflates.retain(|d| key(old_data, d).is_none_or(|k| !new_keys.contains(&k)));
    new_deflates.retain(|d| key(new_data, d).is_none_or(|k| !old_keys.contains(&k)));
}
