//! Content identity of partition blocks.
//!
//! Every distinct block content gets a [`BlockId`]; equal ids mean equal bytes.
//! Ids are handed out in first-seen order, and the all-zero block is always
//! seen first so it owns id 0.
//!
//! Only the location of the first block with a given content is remembered.
//! A hash match is confirmed by reading that block back from its image.

use rustc_hash::FxHashMap;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Error, Result};
use crate::image::Image;

pub type BlockId = u64;

/// Id reserved for a block of zeros.
pub const ZERO_BLOCK_ID: BlockId = 0;

/// Blocks read from the images per batch.
const READ_BATCH_BLOCKS: u64 = 256;

#[derive(Clone, Copy)]
struct UniqueBlock<'a> {
    /// `None` for the zero block, which needs no read to compare.
    image: Option<&'a dyn Image>,
    offset: u64,
    id: BlockId,
}

pub struct BlockMapping<'a> {
    block_size: u64,
    /// xxh3 of the content -> distinct blocks sharing that hash
    buckets: FxHashMap<u64, Vec<UniqueBlock<'a>>>,
    next_id: BlockId,
    scratch: Vec<u8>,
}

impl<'a> BlockMapping<'a> {
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size,
            buckets: FxHashMap::default(),
            next_id: 0,
            scratch: Vec::new(),
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Number of distinct contents seen so far.
    pub fn unique_blocks(&self) -> u64 {
        self.next_id
    }

    /// Returns the id of `data`, read from byte `offset` of `image`, assigning
    /// a new one if this content was never seen.
    pub fn add_block(&mut self, image: &'a dyn Image, offset: u64, data: &[u8]) -> Result<BlockId> {
        self.find_or_insert(Some(image), offset, data)
    }

    fn add_zero_block(&mut self) -> Result<BlockId> {
        let zeros = vec![0u8; self.block_size as usize];
        self.find_or_insert(None, 0, &zeros)
    }

    fn find_or_insert(&mut self, image: Option<&'a dyn Image>, offset: u64, data: &[u8]) -> Result<BlockId> {
        let bucket = self.buckets.entry(xxh3_64(data)).or_default();
        for known in bucket.iter() {
            let equal = match known.image {
                None => data.iter().all(|&b| b == 0),
                Some(known_image) => {
                    self.scratch.resize(data.len(), 0);
                    known_image.read_exact_at(&mut self.scratch, known.offset)?;
                    self.scratch == data
                }
            };
            if equal {
                return Ok(known.id);
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        bucket.push(UniqueBlock { image, offset, id });
        Ok(id)
    }

    /// Ids of the first `num_blocks` blocks of `image`.
    pub fn add_image_blocks(&mut self, image: &'a dyn Image, num_blocks: u64) -> Result<Vec<BlockId>> {
        let block_size = self.block_size as usize;
        let mut ids = Vec::with_capacity(num_blocks as usize);
        let mut buf = Vec::new();
        let mut block = 0;
        while block < num_blocks {
            let count = READ_BATCH_BLOCKS.min(num_blocks - block);
            buf.resize(count as usize * block_size, 0);
            image.read_exact_at(&mut buf, block * self.block_size)?;
            for (i, data) in buf.chunks_exact(block_size).enumerate() {
                let offset = (block + i as u64) * self.block_size;
                ids.push(self.add_block(image, offset, data)?);
            }
            block += count;
        }
        Ok(ids)
    }
}

/// Assigns block ids to both images in one shared id space.
pub fn map_partition_blocks(
    old_image: &dyn Image,
    new_image: &dyn Image,
    old_num_blocks: u64,
    new_num_blocks: u64,
    block_size: u64,
) -> Result<(Vec<BlockId>, Vec<BlockId>)> {
    if block_size == 0 {
        return Err(Error::InvalidConfig("block size must not be zero".into()));
    }
    let mut mapping = BlockMapping::new(block_size);
    let zero_id = mapping.add_zero_block()?;
    debug_assert_eq!(zero_id, ZERO_BLOCK_ID);

    let old_ids = mapping.add_image_blocks(old_image, old_num_blocks)?;
    let new_ids = mapping.add_image_blocks(new_image, new_num_blocks)?;
    tracing::debug!(
        old_num_blocks,
        new_num_blocks,
        unique = mapping.unique_blocks(),
        "mapped partition blocks"
    );
    Ok((old_ids, new_ids))
}
