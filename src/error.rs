//! Crate error type.

use crate::extent::Extent;
use crate::types::OperationType;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate error
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("requested {requested} blocks but only {available} are available")]
    BlockCountOutOfRange { requested: u64, available: u64 },
    #[error("extents cover {over} units but the base only provides {base}")]
    ExtentsExceedBase { over: u64, base: u64 },
    #[error("invalid extents: {0}")]
    InvalidExtents(String),
    #[error("deflates are not ordered or overlap at bit offset {0}")]
    UnorderedDeflates(u64),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("unsupported payload version {major}.{minor}")]
    UnsupportedVersion { major: u64, minor: u32 },
    #[error("filesystem block size {fs} does not match configured block size {config}")]
    BlockSizeMismatch { fs: u64, config: u64 },
    #[error("partition {0:?} has no filesystem")]
    MissingFilesystem(String),
    #[error("read no data for extents {0:?}")]
    EmptyData(Vec<Extent>),
    #[error("{0:?} operation for {1:?} writes no blocks")]
    EmptyOperation(OperationType, String),
    #[error("{codec} compression failed: {source}")]
    Compress {
        codec: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} failed: {reason}")]
    Diff { tool: &'static str, reason: String },
    #[error("failed to generate delta for {name} ({blocks} blocks): {source}")]
    File {
        name: String,
        blocks: u64,
        #[source]
        source: Box<Error>,
    },
    #[error("worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}
