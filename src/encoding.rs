//! Compressors and differs used to build operation data.

use std::io::Write;
use std::sync::Arc;

use bzip2::write::BzEncoder;
use liblzma::stream::{Check, Stream};
use liblzma::write::XzEncoder;

use crate::error::{Error, Result};
use crate::extent::BitExtent;

/// Whole-buffer compressor for the replace family of operations.
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Produces a patch turning `old` into `new`.
pub trait ByteDiffer: Send + Sync {
    fn diff(&self, old: &[u8], new: &[u8]) -> Result<Vec<u8>>;
}

/// Patch generator aware of deflate streams; the deflates are bit offsets
/// into `old` and `new` respectively.
pub trait DeflateDiffer: Send + Sync {
    fn diff(
        &self,
        old: &[u8],
        new: &[u8],
        old_deflates: &[BitExtent],
        new_deflates: &[BitExtent],
    ) -> Result<Vec<u8>>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Bzip2;

impl Compressor for Bzip2 {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let err = |source| Error::Compress { codec: "bzip2", source };
        let mut encoder = BzEncoder::new(Vec::new(), bzip2::Compression::best());
        encoder.write_all(data).map_err(err)?;
        encoder.finish().map_err(err)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Xz {
    pub preset: u32,
}

impl Default for Xz {
    fn default() -> Self {
        Self { preset: 9 }
    }
}

impl Compressor for Xz {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let err = |source| Error::Compress { codec: "xz", source };
        // appliers do not verify the check, so skip it
        let stream = Stream::new_easy_encoder(self.preset, Check::None)
            .map_err(|e| err(std::io::Error::other(e)))?;
        let mut encoder = XzEncoder::new_stream(Vec::new(), stream);
        encoder.write_all(data).map_err(err)?;
        encoder.finish().map_err(err)
    }
}

/// bidiff patch, zstd compressed.
#[derive(Clone, Copy, Debug)]
pub struct Bidiff {
    pub zstd_level: i32,
}

impl Default for Bidiff {
    fn default() -> Self {
        Self { zstd_level: 19 }
    }
}

impl ByteDiffer for Bidiff {
    fn diff(&self, old: &[u8], new: &[u8]) -> Result<Vec<u8>> {
        let mut patch = Vec::new();
        bidiff::simple_diff(old, new, &mut patch).map_err(|e| Error::Diff {
            tool: "bidiff",
            reason: e.to_string(),
        })?;
        zstd::encode_all(&patch[..], self.zstd_level).map_err(|source| Error::Compress {
            codec: "zstd",
            source,
        })
    }
}

/// The collaborators a file unit may call. Shared read-only by all workers.
#[derive(Clone)]
pub struct DiffTools {
    pub xz: Arc<dyn Compressor>,
    pub bzip2: Arc<dyn Compressor>,
    pub bsdiff: Arc<dyn ByteDiffer>,
    /// Without a deflate-aware differ, PUFFDIFF is never produced.
    pub puffdiff: Option<Arc<dyn DeflateDiffer>>,
}

impl Default for DiffTools {
    fn default() -> Self {
        Self {
            xz: Arc::new(Xz::default()),
            bzip2: Arc::new(Bzip2),
            bsdiff: Arc::new(Bidiff::default()),
            puffdiff: None,
        }
    }
}

impl DiffTools {
    pub fn with_puffdiff(mut self, differ: Arc<dyn DeflateDiffer>) -> Self {
        self.puffdiff = Some(differ);
        self
    }
}
