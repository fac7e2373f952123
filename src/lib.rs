//! `payloadkit` – block-level delta payload generation between two partition images.
//!
//! High‑level rules:
//! * Blocks are claimed in passes: unchanged, zero and moved blocks first, then the files of the new filesystem
//!   (each against the old file of the same or nearest name), then whatever no file owns.
//! * Every chunk of a file gets the cheapest operation: ZERO, a replace (raw, bzip2, xz), a copy of identical
//!   source blocks, or a byte/deflate-aware diff that still wins once its manifest overhead is counted.
//! * The payload version decides which operations may be emitted; files are diffed on a worker pool but the
//!   operation list is always in file order.
//!
//! SPDX‑License‑Identifier: Apache‑2.0 OR MIT

pub mod blob;
pub mod block_mapping;
pub mod deflate;
pub mod diff;
pub mod encoding;
pub mod error;
pub mod extent;
pub mod extent_ranges;
pub mod filesystem;
pub mod image;
pub mod partition;
pub mod types;

use sha2::{Digest, Sha256};

pub use blob::{BlobFile, BlobRef, BlobSink, MemoryBlob};
pub use diff::{DiffContext, FileDeltaProcessor};
pub use encoding::DiffTools;
pub use error::{Error, Result};
pub use extent::{BitExtent, ByteExtent, Extent};
pub use extent_ranges::ExtentRanges;
pub use filesystem::{File, FileList, Filesystem, RawFilesystem};
pub use image::Image;
pub use partition::{PartitionConfig, VerityConfig, delta_read_partition};
pub use types::{AnnotatedOperation, Config, InstallOperation, OperationType, PayloadVersion};

pub(crate) fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().into()
}
