//! Per-file operation generation.
//!
//! A file (or pseudo-file) is split into chunks of at most `chunk_blocks`
//! blocks. For every chunk the cheapest operation is picked among:
//!
//! * ZERO when the new bytes are all zero,
//! * the replace family (raw, bzip2 or xz, whichever is smallest),
//! * MOVE/SOURCE_COPY when the old bytes are identical,
//! * a byte diff or a deflate-aware diff against the old bytes.
//!
//! Operations that read the source must carry a hash and their source
//! extents in the manifest, so a diff only wins against the replace family
//! when it stays smaller after that overhead is added.

use std::sync::Arc;
use std::time::Instant;

use crate::blob::BlobSink;
use crate::deflate::{find_and_compact_deflates, remove_equal_bit_extents};
use crate::encoding::DiffTools;
use crate::error::{Error, Result};
use crate::extent::{BitExtent, Extent, blocks_in_extents, extents_sublist, normalize_extents, without_holes};
use crate::image::{Image, read_extents};
use crate::types::{
    AnnotatedOperation, Config, InstallOperation, OP_SRC_HASH_MINOR_PAYLOAD_VERSION, OperationType,
    PayloadVersion,
};

/// Everything a file unit needs besides its own extents. Cheap to clone and
/// shared by all workers of a partition.
#[derive(Clone)]
pub struct DiffContext {
    pub old_image: Arc<dyn Image>,
    pub new_image: Arc<dyn Image>,
    pub version: PayloadVersion,
    pub config: Config,
    pub tools: DiffTools,
    pub blob: Arc<dyn BlobSink>,
}

/// One unit of work: the operations writing `new_extents`, using
/// `old_extents` as source data.
pub struct FileDeltaProcessor {
    ctx: DiffContext,
    name: String,
    old_extents: Vec<Extent>,
    new_extents: Vec<Extent>,
    old_deflates: Vec<BitExtent>,
    new_deflates: Vec<BitExtent>,
    chunk_blocks: Option<u64>,
    new_blocks: u64,
}

impl FileDeltaProcessor {
    pub fn new(
        ctx: DiffContext,
        name: impl Into<String>,
        old_extents: Vec<Extent>,
        new_extents: Vec<Extent>,
        chunk_blocks: Option<u64>,
    ) -> Self {
        let new_blocks = blocks_in_extents(&new_extents);
        Self {
            ctx,
            name: name.into(),
            old_extents,
            new_extents,
            old_deflates: Vec::new(),
            new_deflates: Vec::new(),
            chunk_blocks,
            new_blocks,
        }
    }

    pub fn with_deflates(mut self, old_deflates: Vec<BitExtent>, new_deflates: Vec<BitExtent>) -> Self {
        self.old_deflates = old_deflates;
        self.new_deflates = new_deflates;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks written by this unit; larger units are scheduled first.
    pub fn new_blocks(&self) -> u64 {
        self.new_blocks
    }

    /// Generates the operations of this unit, storing their data in the blob
    /// sink. Any chunk failure fails the whole unit.
    pub fn run(self) -> Result<Vec<AnnotatedOperation>> {
        let start = Instant::now();
        let result = delta_read_file(
            &self.ctx,
            &self.name,
            &self.old_extents,
            &self.new_extents,
            &self.old_deflates,
            &self.new_deflates,
            self.chunk_blocks,
        )
        .and_then(|mut aops| {
            if self.ctx.version.minor >= OP_SRC_HASH_MINOR_PAYLOAD_VERSION {
                add_source_hashes(&mut aops, &*self.ctx.old_image, self.ctx.config.block_size)?;
            }
            Ok(aops)
        });

        match result {
            Ok(aops) => {
                tracing::info!(
                    name = %self.name,
                    blocks = self.new_blocks,
                    elapsed = ?start.elapsed(),
                    "encoded file"
                );
                Ok(aops)
            }
            Err(e) => {
                tracing::error!(name = %self.name, blocks = self.new_blocks, "failed to generate delta: {e}");
                Err(Error::File {
                    name: self.name,
                    blocks: self.new_blocks,
                    source: Box::new(e),
                })
            }
        }
    }
}

/// Splits the old and new extents into chunks at the same logical offsets and
/// produces one operation per chunk, named `name` or `name:<chunk index>`
/// when the file spans several chunks. `None` diffs the file in one piece.
/// Holes on either side are skipped.
pub fn delta_read_file(
    ctx: &DiffContext,
    name: &str,
    old_extents: &[Extent],
    new_extents: &[Extent],
    old_deflates: &[BitExtent],
    new_deflates: &[BitExtent],
    chunk_blocks: Option<u64>,
) -> Result<Vec<AnnotatedOperation>> {
    let old_extents = without_holes(old_extents);
    let new_extents = without_holes(new_extents);
    let total_blocks = blocks_in_extents(&new_extents);
    let chunk = chunk_blocks.filter(|&c| c > 0).unwrap_or(total_blocks).max(1);

    let mut aops = Vec::new();
    let mut block_offset = 0;
    while block_offset < total_blocks {
        // An old side shorter than the new one yields short or empty chunks.
        let mut old_chunk = extents_sublist(&old_extents, block_offset, chunk);
        let mut new_chunk = extents_sublist(&new_extents, block_offset, chunk);
        normalize_extents(&mut old_chunk);
        normalize_extents(&mut new_chunk);

        let (data, op) = read_extents_to_diff(ctx, &old_chunk, &new_chunk, old_deflates, new_deflates)?;

        if op.dst_extents.is_empty() {
            if op.op_type != OperationType::Move {
                return Err(Error::EmptyOperation(op.op_type, name.to_owned()));
            }
            tracing::info!(name, "empty MOVE operation, skipping");
            block_offset += chunk;
            continue;
        }

        let op_name = if chunk < total_blocks {
            format!("{name}:{}", block_offset / chunk)
        } else {
            name.to_owned()
        };
        let mut aop = AnnotatedOperation::new(op_name, op);
        aop.set_operation_blob(&data, &*ctx.blob)?;
        aops.push(aop);
        block_offset += chunk;
    }
    Ok(aops)
}

/// Picks the best operation writing `new_extents` given the data in
/// `old_extents`. Returns the operation data and the operation, whose data
/// fields are left unset.
pub fn read_extents_to_diff(
    ctx: &DiffContext,
    old_extents: &[Extent],
    new_extents: &[Extent],
    old_deflates: &[BitExtent],
    new_deflates: &[BitExtent],
) -> Result<(Vec<u8>, InstallOperation)> {
    use OperationType::*;

    let version = &ctx.version;
    let config = &ctx.config;
    let block_size = config.block_size;
    let read_bytes = blocks_in_extents(old_extents) * block_size;

    let mut bsdiff_allowed = version.operation_allowed(SourceBsdiff) || version.operation_allowed(Bsdiff);
    if bsdiff_allowed && read_bytes > config.max_bsdiff_size {
        tracing::info!(bytes = read_bytes, "bsdiff skipped, data too big");
        bsdiff_allowed = false;
    }
    let mut puffdiff_allowed = version.operation_allowed(Puffdiff);
    if puffdiff_allowed && read_bytes > config.max_puffdiff_size {
        tracing::info!(bytes = read_bytes, "puffdiff skipped, data too big");
        puffdiff_allowed = false;
    }

    let mut src_extents = old_extents.to_vec();
    let mut dst_extents = new_extents.to_vec();

    let new_data = read_extents(&*ctx.new_image, new_extents, block_size)?;
    if new_data.is_empty() {
        return Err(Error::EmptyData(new_extents.to_vec()));
    }

    let (mut data_blob, mut op_type) = generate_best_full_operation(&new_data, version, &ctx.tools)?;

    let mut old_data = Vec::new();
    if read_bytes > 0 && op_type != Zero {
        old_data = read_extents(&*ctx.old_image, &src_extents, block_size)?;
        if old_data == new_data {
            op_type = if version.operation_allowed(SourceCopy) {
                SourceCopy
            } else {
                Move
            };
            data_blob = Vec::new();
        } else if is_diff_operation_better(op_type, data_blob.len() as u64, 0, src_extents.len(), config) {
            if bsdiff_allowed {
                let delta = ctx.tools.bsdiff.diff(&old_data, &new_data)?;
                if delta.is_empty() {
                    return Err(Error::Diff {
                        tool: "bsdiff",
                        reason: "empty patch".into(),
                    });
                }
                if is_diff_operation_better(
                    op_type,
                    data_blob.len() as u64,
                    delta.len() as u64,
                    src_extents.len(),
                    config,
                ) {
                    op_type = if version.operation_allowed(BrotliBsdiff) {
                        BrotliBsdiff
                    } else if version.operation_allowed(SourceBsdiff) {
                        SourceBsdiff
                    } else {
                        Bsdiff
                    };
                    data_blob = delta;
                }
            }
            if let Some(differ) = ctx.tools.puffdiff.as_ref().filter(|_| puffdiff_allowed) {
                // Both buffers are concatenations of their extents, so the
                // deflates are rebased onto them.
                let mut src_deflates = find_and_compact_deflates(&src_extents, old_deflates, block_size)?;
                let mut dst_deflates = find_and_compact_deflates(&dst_extents, new_deflates, block_size)?;
                remove_equal_bit_extents(&old_data, &new_data, &mut src_deflates, &mut dst_deflates);

                if !src_deflates.is_empty() && !dst_deflates.is_empty() {
                    let delta = differ.diff(&old_data, &new_data, &src_deflates, &dst_deflates)?;
                    if delta.is_empty() {
                        return Err(Error::Diff {
                            tool: "puffdiff",
                            reason: "empty patch".into(),
                        });
                    }
                    if is_diff_operation_better(
                        op_type,
                        data_blob.len() as u64,
                        delta.len() as u64,
                        src_extents.len(),
                        config,
                    ) {
                        op_type = Puffdiff;
                        data_blob = delta;
                    }
                }
            }
        }
    }

    let mut op = InstallOperation::new(op_type);
    let old_len = old_data.len() as u64;
    let new_len = new_data.len() as u64;
    if op_type == Move {
        let removed = remove_identical_block_ranges(&mut src_extents, &mut dst_extents, new_len, block_size);
        op.src_length = Some(old_len.saturating_sub(removed));
        op.dst_length = Some(new_len.saturating_sub(removed));
    }
    // Older appliers read these lengths; newer minor versions must not see
    // them on SOURCE_BSDIFF.
    if op_type == Bsdiff || (op_type == SourceBsdiff && version.minor <= OP_SRC_HASH_MINOR_PAYLOAD_VERSION) {
        op.src_length = Some(old_len);
        op.dst_length = Some(new_len);
    }

    if !op_type.is_no_source() {
        op.src_extents = src_extents;
    }
    op.dst_extents = dst_extents;
    Ok((data_blob, op))
}

/// Best operation writing `new_data` without reading the source: ZERO, or the
/// smallest of REPLACE_XZ, REPLACE_BZ and REPLACE.
pub fn generate_best_full_operation(
    new_data: &[u8],
    version: &PayloadVersion,
    tools: &DiffTools,
) -> Result<(Vec<u8>, OperationType)> {
    use OperationType::*;

    if new_data.is_empty() {
        return Err(Error::EmptyData(Vec::new()));
    }
    if version.operation_allowed(Zero) && new_data.iter().all(|&b| b == 0) {
        return Ok((Vec::new(), Zero));
    }

    let mut best: Option<(Vec<u8>, OperationType)> = None;
    if version.operation_allowed(ReplaceXz) {
        let xz = tools.xz.compress(new_data)?;
        if !xz.is_empty() {
            best = Some((xz, ReplaceXz));
        }
    }
    if version.operation_allowed(ReplaceBz) {
        let bz = tools.bzip2.compress(new_data)?;
        if !bz.is_empty() && best.as_ref().is_none_or(|(blob, _)| blob.len() > bz.len()) {
            best = Some((bz, ReplaceBz));
        }
    }

    match best {
        Some(best) if best.0.len() < new_data.len() => Ok(best),
        _ => Ok((new_data.to_vec(), Replace)),
    }
}

/// Whether a diff of `diff_size` bytes reading `num_src_extents` source
/// extents beats the current operation `op_type` whose data is
/// `old_blob_size` bytes. Against the replace family the diff also pays for
/// its manifest overhead.
pub fn is_diff_operation_better(
    op_type: OperationType,
    old_blob_size: u64,
    diff_size: u64,
    num_src_extents: usize,
    config: &Config,
) -> bool {
    if !op_type.is_replace() {
        return diff_size < old_blob_size;
    }
    let overhead = config.diff_overhead + num_src_extents as u64 * config.diff_overhead_per_extent;
    diff_size + overhead < old_blob_size
}

/// Removes the block ranges that a MOVE would copy onto themselves from both
/// extent lists, and returns the number of bytes no longer moved. `total_bytes`
/// is the length of the moved content; when the last removed block is only
/// partly used, only its used bytes are counted.
pub fn remove_identical_block_ranges(
    src_extents: &mut Vec<Extent>,
    dst_extents: &mut Vec<Extent>,
    total_bytes: u64,
    block_size: u64,
) -> u64 {
    let (mut src_idx, mut dst_idx) = (0, 0);
    let (mut src_offset, mut dst_offset) = (0, 0);
    let mut removed_bytes = 0;
    let mut removed_last = false;

    while src_idx < src_extents.len() && dst_idx < dst_extents.len() {
        let src = src_extents[src_idx];
        let dst = dst_extents[dst_idx];
        let remove = !src.is_hole() && !dst.is_hole() && src.start_block + src_offset == dst.start_block + dst_offset;

        let blocks = (src.num_blocks - src_offset).min(dst.num_blocks - dst_offset);
        let (prev_src, prev_dst) = (src_offset, dst_offset);
        src_offset += blocks;
        dst_offset += blocks;

        if process_extent_block_range(src_extents, &mut src_idx, remove, prev_src, src_offset) {
            src_offset = 0;
        }
        if process_extent_block_range(dst_extents, &mut dst_idx, remove, prev_dst, dst_offset) {
            dst_offset = 0;
        }
        if remove {
            removed_bytes += blocks * block_size;
        }
        removed_last = remove;
    }

    let partial = total_bytes % block_size;
    if removed_last && partial != 0 {
        removed_bytes = removed_bytes.saturating_sub(block_size - partial);
    }
    removed_bytes
}

/// Handles blocks `[range_start, range_end)` of `extents[*idx]`, removing them
/// if `remove`. Advances `idx` past the extent once it is done with and
/// returns true when the next range starts at offset 0 of `extents[*idx]`.
fn process_extent_block_range(
    extents: &mut Vec<Extent>,
    idx: &mut usize,
    remove: bool,
    range_start: u64,
    range_end: u64,
) -> bool {
    let Extent {
        start_block,
        num_blocks,
    } = extents[*idx];
    let range_size = range_end - range_start;

    if !remove {
        if range_end == num_blocks {
            *idx += 1;
            return true;
        }
        return false;
    }

    if range_size == num_blocks {
        extents.remove(*idx);
    } else if range_end == num_blocks {
        extents[*idx].num_blocks -= range_size;
        *idx += 1;
    } else if range_start == 0 {
        extents[*idx] = Extent::new(start_block + range_size, num_blocks - range_size);
    } else {
        extents[*idx].num_blocks = range_start;
        *idx += 1;
        extents.insert(*idx, Extent::new(start_block + range_end, num_blocks - range_end));
    }
    true
}

/// Sets `src_sha256_hash` on every operation with source extents.
pub fn add_source_hashes(aops: &mut [AnnotatedOperation], old_image: &dyn Image, block_size: u64) -> Result<()> {
    for aop in aops.iter_mut().filter(|aop| !aop.op.src_extents.is_empty()) {
        let data = read_extents(old_image, &aop.op.src_extents, block_size)?;
        aop.op.src_sha256_hash = Some(crate::sha256(&data));
    }
    Ok(())
}
