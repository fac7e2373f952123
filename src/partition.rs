//! Operations for a whole partition.
//!
//! Blocks are claimed in passes, each pass only looking at blocks no earlier
//! pass claimed:
//!
//! 1. blocks that did not change (in-place formats only), zero blocks and
//!    blocks found elsewhere in the old image,
//! 2. the files of the new filesystem, each diffed against the old file of
//!    the same (or most similar) name,
//! 3. everything left, as one `<non-file-data>` pseudo-file.
//!
//! Files are diffed concurrently, but the result is always in file order.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;

use crate::blob::BlobSink;
use crate::block_mapping::{BlockId, ZERO_BLOCK_ID, map_partition_blocks};
use crate::diff::{DiffContext, FileDeltaProcessor, add_source_hashes, delta_read_file};
use crate::encoding::DiffTools;
use crate::error::{Error, Result};
use crate::extent::{
    Extent, append_block_to_extents, blocks_in_extents, expand_extents, extents_sublist, extents_to_string,
    without_holes,
};
use crate::extent_ranges::{ExtentRanges, filter_extent_ranges};
use crate::filesystem::{File, Filesystem};
use crate::image::Image;
use crate::types::{
    AnnotatedOperation, Config, InstallOperation, OP_SRC_HASH_MINOR_PAYLOAD_VERSION, OperationType, PayloadVersion,
    VERITY_MINOR_PAYLOAD_VERSION,
};

const ZEROS_NAME: &str = "<zeros>";
const IDENTICAL_NAME: &str = "<identical-blocks>";
const NON_FILE_NAME: &str = "<non-file-data>";

/// Blocks of the new image written by dm-verity at install time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VerityConfig {
    pub hash_tree_extent: Extent,
    pub fec_extent: Extent,
}

impl VerityConfig {
    pub fn is_empty(&self) -> bool {
        self.hash_tree_extent.num_blocks == 0 && self.fec_extent.num_blocks == 0
    }
}

#[derive(Clone)]
pub struct PartitionConfig {
    pub name: String,
    pub image: Arc<dyn Image>,
    /// Partition size in bytes; trailing bytes short of a block are ignored.
    pub size: u64,
    pub fs: Option<Arc<dyn Filesystem>>,
    pub verity: VerityConfig,
}

impl PartitionConfig {
    pub fn new(name: impl Into<String>, image: Arc<dyn Image>, size: u64) -> Self {
        Self {
            name: name.into(),
            image,
            size,
            fs: None,
            verity: VerityConfig::default(),
        }
    }

    pub fn with_filesystem(mut self, fs: Arc<dyn Filesystem>) -> Self {
        self.fs = Some(fs);
        self
    }

    pub fn with_verity(mut self, verity: VerityConfig) -> Self {
        self.verity = verity;
        self
    }

    fn check_block_size(&self, block_size: u64) -> Result<()> {
        match &self.fs {
            Some(fs) if fs.block_size() != block_size => Err(Error::BlockSizeMismatch {
                fs: fs.block_size(),
                config: block_size,
            }),
            _ => Ok(()),
        }
    }
}

/// Generates the operations turning `old_part` into `new_part`, in file order.
/// Operation data is appended to `blob`. Any failure aborts the partition.
pub fn delta_read_partition(
    old_part: &PartitionConfig,
    new_part: &PartitionConfig,
    config: &Config,
    version: PayloadVersion,
    tools: &DiffTools,
    blob: Arc<dyn BlobSink>,
) -> Result<Vec<AnnotatedOperation>> {
    version.validate()?;
    config.validate()?;
    let block_size = config.block_size;
    old_part.check_block_size(block_size)?;
    new_part.check_block_size(block_size)?;
    let new_fs = new_part
        .fs
        .as_ref()
        .ok_or_else(|| Error::MissingFilesystem(new_part.name.clone()))?;

    let ctx = DiffContext {
        old_image: Arc::clone(&old_part.image),
        new_image: Arc::clone(&new_part.image),
        version,
        config: *config,
        tools: tools.clone(),
        blob,
    };
    let old_num_blocks = old_part.size / block_size;
    let new_num_blocks = new_part.size / block_size;
    let soft_chunk_blocks = config.soft_chunk_blocks();

    let mut old_visited = ExtentRanges::new();
    let mut new_visited = ExtentRanges::new();

    if version.minor >= VERITY_MINOR_PAYLOAD_VERSION && !new_part.verity.is_empty() {
        let verity = new_part.verity;
        tracing::info!(
            hash_tree = %extents_to_string(&[verity.hash_tree_extent]),
            fec = %extents_to_string(&[verity.fec_extent]),
            "skipping verity blocks"
        );
        new_visited.add_extent(verity.hash_tree_extent);
        new_visited.add_extent(verity.fec_extent);
    }

    let mut old_zero_blocks = ExtentRanges::new();
    let mut aops = delta_moved_and_zero_blocks(
        &ctx,
        old_num_blocks,
        new_num_blocks,
        Some(soft_chunk_blocks),
        &mut old_visited,
        &mut new_visited,
        &mut old_zero_blocks,
    )?;

    let old_files: BTreeMap<String, File> = match &old_part.fs {
        Some(fs) => fs.files()?.into_iter().map(|f| (f.name.clone(), f)).collect(),
        None => BTreeMap::new(),
    };
    let new_files = new_fs.files()?;

    let mut processors = Vec::new();
    for new_file in new_files {
        // Blocks shared with an earlier file (hard links, tail packing) are
        // only written once. Holes are never written.
        let new_extents = without_holes(&filter_extent_ranges(&new_file.extents, &new_visited));
        new_visited.add_extents(&new_extents);
        if new_extents.is_empty() {
            continue;
        }

        let old_file = get_old_file(&old_files, &new_file.name);
        let old_extents = if version.inplace_update() {
            filter_extent_ranges(&old_file.extents, &old_visited)
        } else {
            filter_extent_ranges(&old_file.extents, &old_zero_blocks)
        };
        let old_extents = without_holes(&old_extents);
        old_visited.add_extents(&old_extents);

        processors.push(
            FileDeltaProcessor::new(
                ctx.clone(),
                new_file.name,
                old_extents,
                new_extents,
                config.hard_chunk_blocks,
            )
            .with_deflates(old_file.deflates, new_file.deflates),
        );
    }

    let new_unvisited = filter_extent_ranges(&[Extent::new(0, new_num_blocks)], &new_visited);
    if !new_unvisited.is_empty() {
        let old_unvisited = if old_part.fs.is_some() {
            filter_extent_ranges(&[Extent::new(0, old_num_blocks)], &old_visited)
        } else {
            Vec::new()
        };
        tracing::info!(
            blocks = blocks_in_extents(&new_unvisited),
            chunk_blocks = soft_chunk_blocks,
            "scanning unwritten blocks"
        );
        // No structure is known here, so the small chunk applies.
        processors.push(FileDeltaProcessor::new(
            ctx.clone(),
            NON_FILE_NAME,
            old_unvisited,
            new_unvisited,
            Some(soft_chunk_blocks),
        ));
    }

    let threads = max_threads(config);
    for unit_aops in run_processors(processors, threads)? {
        aops.extend(unit_aops);
    }

    if version.inplace_update() {
        filter_noop_operations(&mut aops);
    }
    tracing::info!(partition = %new_part.name, operations = aops.len(), "generated partition delta");
    Ok(aops)
}

/// Runs every unit on a pool of `threads` workers and returns their results
/// in unit order.
fn run_processors(processors: Vec<FileDeltaProcessor>, threads: usize) -> Result<Vec<Vec<AnnotatedOperation>>> {
    if processors.is_empty() {
        return Ok(Vec::new());
    }
    let runtime = tokio::runtime::Builder::new_current_thread()
        .max_blocking_threads(threads)
        .thread_name("payload-generator")
        .build()?;

    // Start the largest units first so a big file does not run alone at the end.
    let mut order: Vec<usize> = (0..processors.len()).collect();
    if processors.len() > threads {
        order.sort_by_key(|&i| Reverse(processors[i].new_blocks()));
    }

    let mut pending: Vec<Option<FileDeltaProcessor>> = processors.into_iter().map(Some).collect();
    let mut handles: Vec<Option<JoinHandle<Result<Vec<AnnotatedOperation>>>>> =
        pending.iter().map(|_| None).collect();
    for i in order {
        if let Some(processor) = pending[i].take() {
            handles[i] = Some(runtime.spawn_blocking(move || processor.run()));
        }
    }

    let results = runtime.block_on(futures::future::join_all(handles.into_iter().flatten()));
    let mut per_unit = Vec::with_capacity(results.len());
    for joined in results {
        per_unit.push(joined??);
    }
    Ok(per_unit)
}

/// Claims blocks that need no file context: unchanged blocks (in-place
/// formats), zero blocks and blocks whose content exists elsewhere in the old
/// image. `old_zero_blocks` receives the old blocks holding zeros.
pub fn delta_moved_and_zero_blocks(
    ctx: &DiffContext,
    old_num_blocks: u64,
    new_num_blocks: u64,
    chunk_blocks: Option<u64>,
    old_visited: &mut ExtentRanges,
    new_visited: &mut ExtentRanges,
    old_zero_blocks: &mut ExtentRanges,
) -> Result<Vec<AnnotatedOperation>> {
    let version = ctx.version;
    let block_size = ctx.config.block_size;
    let (old_ids, new_ids) =
        map_partition_blocks(&*ctx.old_image, &*ctx.new_image, old_num_blocks, new_num_blocks, block_size)?;

    // In place, a block that did not change is already where it belongs.
    if version.inplace_update() {
        for block in 0..old_num_blocks.min(new_num_blocks) {
            if old_ids[block as usize] == new_ids[block as usize]
                && !old_visited.contains_block(block)
                && !new_visited.contains_block(block)
            {
                old_visited.add_block(block);
                new_visited.add_block(block);
            }
        }
    }

    // Filled from the end, so `last()` is the lowest old block with that content.
    let mut old_blocks_map: FxHashMap<BlockId, Vec<u64>> = FxHashMap::default();
    for block in (0..old_num_blocks).rev() {
        let id = old_ids[block as usize];
        if id == ZERO_BLOCK_ID {
            // Reading zeros back is pointless, and discarded blocks may not
            // read as zeros at all.
            old_zero_blocks.add_block(block);
        } else if !old_visited.contains_block(block) {
            old_blocks_map.entry(id).or_default().push(block);
        }
    }
    old_visited.add_ranges(old_zero_blocks);

    let mut new_zeros = Vec::new();
    let mut old_identical = Vec::new();
    let mut new_identical = Vec::new();
    for block in 0..new_num_blocks {
        if new_visited.contains_block(block) {
            continue;
        }
        let id = new_ids[block as usize];
        if id == ZERO_BLOCK_ID {
            append_block_to_extents(&mut new_zeros, block);
            continue;
        }
        let Some(sources) = old_blocks_map.get_mut(&id) else {
            continue;
        };
        let Some(&source) = sources.last() else {
            continue;
        };
        append_block_to_extents(&mut old_identical, source);
        append_block_to_extents(&mut new_identical, block);
        // In place, a source block may be overwritten after its first use.
        if version.inplace_update() {
            sources.pop();
        }
    }

    let chunk = chunk_blocks.filter(|&c| c > 0).unwrap_or(new_num_blocks).max(1);
    let mut aops = Vec::new();

    new_visited.add_extents(&new_zeros);
    for extent in &new_zeros {
        if version.operation_allowed(OperationType::Zero) {
            let mut offset = 0;
            while offset < extent.num_blocks {
                let num_blocks = (extent.num_blocks - offset).min(chunk);
                let mut op = InstallOperation::new(OperationType::Zero);
                op.dst_extents = vec![Extent::new(extent.start_block + offset, num_blocks)];
                aops.push(AnnotatedOperation::new(ZEROS_NAME, op));
                offset += chunk;
            }
        } else {
            aops.extend(delta_read_file(ctx, ZEROS_NAME, &[], &[*extent], &[], &[], Some(chunk))?);
        }
    }
    tracing::info!(
        operations = aops.len(),
        blocks = blocks_in_extents(&new_zeros),
        "produced operations for zeroed blocks"
    );

    let zero_ops = aops.len();
    let copy_type = if version.operation_allowed(OperationType::SourceCopy) {
        OperationType::SourceCopy
    } else {
        OperationType::Move
    };
    let mut used_blocks = 0;
    old_visited.add_extents(&old_identical);
    new_visited.add_extents(&new_identical);
    for extent in &new_identical {
        let mut offset = 0;
        while offset < extent.num_blocks {
            let num_blocks = (extent.num_blocks - offset).min(chunk);
            let mut op = InstallOperation::new(copy_type);
            op.src_extents = extents_sublist(&old_identical, used_blocks, num_blocks);
            op.dst_extents = vec![Extent::new(extent.start_block + offset, num_blocks)];
            debug_assert_eq!(op.dst_extents, extents_sublist(&new_identical, used_blocks, num_blocks));
            aops.push(AnnotatedOperation::new(IDENTICAL_NAME, op));
            used_blocks += num_blocks;
            offset += chunk;
        }
    }
    tracing::info!(
        operations = aops.len() - zero_ops,
        blocks = used_blocks,
        "produced operations for identical blocks"
    );

    if version.minor >= OP_SRC_HASH_MINOR_PAYLOAD_VERSION {
        add_source_hashes(&mut aops[zero_ops..], &*ctx.old_image, block_size)?;
    }
    Ok(aops)
}

/// The old file to diff `new_name` against: the file of the same name, or
/// else the one with the smallest edit distance below the name's length.
/// Among equally close names the first in name order wins. Returns an empty
/// file when nothing qualifies.
pub fn get_old_file(old_files: &BTreeMap<String, File>, new_name: &str) -> File {
    if let Some(file) = old_files.get(new_name) {
        return file.clone();
    }
    let mut min_distance = new_name.len();
    let mut closest = None;
    for (name, file) in old_files {
        let distance = levenshtein_distance(new_name, name);
        if distance < min_distance {
            min_distance = distance;
            closest = Some(file);
        }
    }
    match closest {
        Some(file) => {
            tracing::info!("using {} as source for {new_name}", file.name);
            file.clone()
        }
        None => File::default(),
    }
}

pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let mut distances: Vec<usize> = (0..=a.len()).collect();
    for (i, &cb) in b.iter().enumerate() {
        let mut previous = distances[0];
        distances[0] = i + 1;
        for (j, &ca) in a.iter().enumerate() {
            let substitution = previous + usize::from(ca != cb);
            previous = distances[j + 1];
            distances[j + 1] = (distances[j + 1] + 1).min(distances[j] + 1).min(substitution);
        }
    }
    distances[a.len()]
}

/// Worker count: `config.max_threads`, or the available processors but at
/// least 4.
pub fn max_threads(config: &Config) -> usize {
    config
        .max_threads
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map_or(1, std::num::NonZeroUsize::get)
                .max(4)
        })
        .max(1)
}

/// A MOVE that copies every block onto itself.
pub fn is_noop_operation(op: &InstallOperation) -> bool {
    op.op_type == OperationType::Move && expand_extents(&op.src_extents) == expand_extents(&op.dst_extents)
}

pub fn filter_noop_operations(aops: &mut Vec<AnnotatedOperation>) {
    aops.retain(|aop| !is_noop_operation(&aop.op));
}
