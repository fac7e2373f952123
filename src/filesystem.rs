//! Filesystem view of a partition image: which blocks belong to which file.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::extent::{BitExtent, Extent};

/// Key/value settings stored in an image, e.g. the payload minor version.
pub type Settings = BTreeMap<String, String>;

/// A named region of a filesystem. Pseudo-files (metadata, journals) are
/// allowed and carry names like `<inode-blocks>`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct File {
    pub name: String,
    /// Physical blocks of the file, in logical file order.
    pub extents: Vec<Extent>,
    /// Deflate streams, as absolute bit offsets in the partition.
    pub deflates: Vec<BitExtent>,
}

impl File {
    pub fn new(name: impl Into<String>, extents: Vec<Extent>) -> Self {
        Self {
            name: name.into(),
            extents,
            deflates: Vec::new(),
        }
    }

    pub fn with_deflates(mut self, deflates: Vec<BitExtent>) -> Self {
        self.deflates = deflates;
        self
    }
}

pub trait Filesystem: Send + Sync {
    fn block_size(&self) -> u64;

    fn block_count(&self) -> u64;

    /// Files in enumeration order. Operation order follows this order.
    fn files(&self) -> Result<Vec<File>>;

    fn load_settings(&self) -> Result<Settings>;
}

/// A filesystem with no structure: it owns no files and every block ends up
/// in the non-file pass.
#[derive(Clone, Debug)]
pub struct RawFilesystem {
    block_size: u64,
    block_count: u64,
}

impl RawFilesystem {
    pub fn new(block_size: u64, block_count: u64) -> Self {
        Self {
            block_size,
            block_count,
        }
    }
}

impl Filesystem for RawFilesystem {
    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn files(&self) -> Result<Vec<File>> {
        Ok(Vec::new())
    }

    fn load_settings(&self) -> Result<Settings> {
        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "raw filesystem has no settings",
        )))
    }
}

/// A fixed list of files over a partition, for callers that already know the
/// file layout.
#[derive(Clone, Debug)]
pub struct FileList {
    pub block_size: u64,
    pub block_count: u64,
    pub files: Vec<File>,
    pub settings: Settings,
}

impl Filesystem for FileList {
    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn files(&self) -> Result<Vec<File>> {
        Ok(self.files.clone())
    }

    fn load_settings(&self) -> Result<Settings> {
        Ok(self.settings.clone())
    }
}

/// Parses `KEY=VALUE` lines. Blank lines, `#` comments and lines without `=`
/// are skipped; keys and values are trimmed.
pub fn parse_settings(text: &str) -> Settings {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_owned(), value.trim().to_owned()))
        .collect()
}
