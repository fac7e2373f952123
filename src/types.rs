//! Configuration, payload versions and operation records.

use std::fmt;

use crate::blob::BlobSink;
use crate::error::{Error, Result};
use crate::extent::Extent;
use crate::filesystem::Filesystem;

pub const LEGACY_MAJOR_PAYLOAD_VERSION: u64 = 1;
pub const MAJOR_PAYLOAD_VERSION: u64 = 2;

pub const FULL_PAYLOAD_MINOR_VERSION: u32 = 0;
pub const INPLACE_MINOR_PAYLOAD_VERSION: u32 = 1;
pub const SOURCE_MINOR_PAYLOAD_VERSION: u32 = 2;
pub const OP_SRC_HASH_MINOR_PAYLOAD_VERSION: u32 = 3;
pub const BROTLI_BSDIFF_MINOR_PAYLOAD_VERSION: u32 = 4;
pub const PUFFDIFF_MINOR_PAYLOAD_VERSION: u32 = 5;
pub const VERITY_MINOR_PAYLOAD_VERSION: u32 = 6;

/// Settings key holding the minor version an image expects updates in.
pub const MINOR_VERSION_KEY: &str = "PAYLOAD_MINOR_VERSION";

const MIB: u64 = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Partition block size (bytes)
    pub block_size: u64,
    /// Block limit of one operation for file data; `None` diffs every file as a single chunk.
    pub hard_chunk_blocks: Option<u64>,
    /// Chunk size for data not attributed to any file (bytes)
    pub soft_chunk_size: u64,
    /// Byte-diff candidates are skipped above this many source bytes.
    pub max_bsdiff_size: u64,
    /// Deflate-aware diff candidates are skipped above this many source bytes.
    pub max_puffdiff_size: u64,
    /// Fixed manifest cost of an operation carrying a source (bytes)
    pub diff_overhead: u64,
    /// Manifest cost of each source extent (bytes)
    pub diff_overhead_per_extent: u64,
    /// Worker threads; `None` uses the available processors, at least 4.
    pub max_threads: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: 4096,
            hard_chunk_blocks: Some(200 * MIB / 4096),
            soft_chunk_size: 2 * MIB,
            max_bsdiff_size: 200 * MIB,
            max_puffdiff_size: 150 * MIB,
            // tag + length + 32-byte hash for the source hash, tag + length for
            // the source extents
            diff_overhead: 1 + 1 + 32 + 1 + 1,
            // two varints per extent, num_blocks usually small
            diff_overhead_per_extent: 6,
            max_threads: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::InvalidConfig("block size must not be zero".into()));
        }
        Ok(())
    }

    /// Chunk size in blocks for non-file data, never above the hard chunk.
    pub fn soft_chunk_blocks(&self) -> u64 {
        let soft = self.soft_chunk_size.checked_div(self.block_size).unwrap_or(0).max(1);
        match self.hard_chunk_blocks {
            Some(hard) => soft.min(hard),
            None => soft,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OperationType {
    Move,
    SourceCopy,
    #[default]
    Replace,
    ReplaceBz,
    ReplaceXz,
    Zero,
    Bsdiff,
    SourceBsdiff,
    BrotliBsdiff,
    Puffdiff,
}

impl OperationType {
    pub fn is_replace(self) -> bool {
        matches!(self, Self::Replace | Self::ReplaceBz | Self::ReplaceXz)
    }

    /// Operations that never read the source partition.
    pub fn is_no_source(self) -> bool {
        self.is_replace() || self == Self::Zero
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Move => "MOVE",
            Self::SourceCopy => "SOURCE_COPY",
            Self::Replace => "REPLACE",
            Self::ReplaceBz => "REPLACE_BZ",
            Self::ReplaceXz => "REPLACE_XZ",
            Self::Zero => "ZERO",
            Self::Bsdiff => "BSDIFF",
            Self::SourceBsdiff => "SOURCE_BSDIFF",
            Self::BrotliBsdiff => "BROTLI_BSDIFF",
            Self::Puffdiff => "PUFFDIFF",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target payload format revision. Decides which operations may be emitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadVersion {
    pub major: u64,
    pub minor: u32,
}

impl PayloadVersion {
    pub const fn new(major: u64, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn validate(&self) -> Result<()> {
        let major_ok = matches!(self.major, LEGACY_MAJOR_PAYLOAD_VERSION | MAJOR_PAYLOAD_VERSION);
        if !major_ok || self.minor > VERITY_MINOR_PAYLOAD_VERSION {
            return Err(Error::UnsupportedVersion {
                major: self.major,
                minor: self.minor,
            });
        }
        Ok(())
    }

    pub fn operation_allowed(&self, op: OperationType) -> bool {
        use OperationType::*;
        match op {
            Replace | ReplaceBz => true,
            ReplaceXz => {
                self.major == MAJOR_PAYLOAD_VERSION
                    || self.minor >= OP_SRC_HASH_MINOR_PAYLOAD_VERSION
            }
            // earlier appliers mishandled ZERO
            Zero => self.minor >= BROTLI_BSDIFF_MINOR_PAYLOAD_VERSION,
            Move | Bsdiff => self.minor == INPLACE_MINOR_PAYLOAD_VERSION,
            SourceCopy | SourceBsdiff => self.minor >= SOURCE_MINOR_PAYLOAD_VERSION,
            BrotliBsdiff => self.minor >= BROTLI_BSDIFF_MINOR_PAYLOAD_VERSION,
            Puffdiff => self.minor >= PUFFDIFF_MINOR_PAYLOAD_VERSION,
        }
    }

    /// The in-place format overwrites the source partition while applying.
    pub fn inplace_update(&self) -> bool {
        self.minor == INPLACE_MINOR_PAYLOAD_VERSION
    }

    pub fn is_delta(&self) -> bool {
        self.minor != FULL_PAYLOAD_MINOR_VERSION
    }

    /// Picks the minor version from the first old filesystem that advertises
    /// one in its settings, falling back to the in-place format.
    pub fn detect_minor(major: u64, old_filesystems: &[&dyn Filesystem]) -> Self {
        for fs in old_filesystems {
            let Ok(settings) = fs.load_settings() else {
                continue;
            };
            let Some(value) = settings.get(MINOR_VERSION_KEY) else {
                continue;
            };
            match value.trim().parse() {
                Ok(minor) => {
                    tracing::info!(minor, "auto-detected minor version");
                    return Self::new(major, minor);
                }
                Err(_) => tracing::warn!(value = %value, "unparsable {MINOR_VERSION_KEY}"),
            }
        }
        Self::new(major, INPLACE_MINOR_PAYLOAD_VERSION)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstallOperation {
    pub op_type: OperationType,
    pub src_extents: Vec<Extent>,
    pub dst_extents: Vec<Extent>,
    /// Legacy field, see [`crate::diff::read_extents_to_diff`].
    pub src_length: Option<u64>,
    /// Legacy field, see [`crate::diff::read_extents_to_diff`].
    pub dst_length: Option<u64>,
    pub data_offset: Option<u64>,
    pub data_length: Option<u64>,
    pub data_sha256_hash: Option<[u8; 32]>,
    pub src_sha256_hash: Option<[u8; 32]>,
}

impl InstallOperation {
    pub fn new(op_type: OperationType) -> Self {
        Self {
            op_type,
            ..Self::default()
        }
    }
}

/// An operation plus a human-readable name of what it writes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AnnotatedOperation {
    pub name: String,
    pub op: InstallOperation,
}

impl AnnotatedOperation {
    pub fn new(name: impl Into<String>, op: InstallOperation) -> Self {
        Self {
            name: name.into(),
            op,
        }
    }

    /// Stores `blob` in the sink and points the operation at it. An empty
    /// blob clears the data fields instead.
    pub fn set_operation_blob(&mut self, blob: &[u8], sink: &dyn BlobSink) -> Result<()> {
        if blob.is_empty() {
            self.op.data_offset = None;
            self.op.data_length = None;
            self.op.data_sha256_hash = None;
            return Ok(());
        }
        let stored = sink.append(blob)?;
        self.op.data_offset = Some(stored.offset);
        self.op.data_length = Some(stored.length);
        self.op.data_sha256_hash = Some(crate::sha256(blob));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlob;
    use crate::filesystem::{RawFilesystem, Settings};
    use OperationType::*;

    #[test]
    fn zero_block_size_is_invalid() {
        let config = Config {
            block_size: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        assert_eq!(config.soft_chunk_blocks(), 1);
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn in_place_version_allows_move_family_only() {
        let v = PayloadVersion::new(LEGACY_MAJOR_PAYLOAD_VERSION, INPLACE_MINOR_PAYLOAD_VERSION);
        assert!(v.inplace_update());
        assert!(v.operation_allowed(Move));
        assert!(v.operation_allowed(Bsdiff));
        assert!(!v.operation_allowed(SourceCopy));
        assert!(!v.operation_allowed(Zero));
        assert!(!v.operation_allowed(ReplaceXz));
        assert!(v.operation_allowed(ReplaceBz));
    }

    #[test]
    fn newer_versions_unlock_operations() {
        let v = PayloadVersion::new(MAJOR_PAYLOAD_VERSION, VERITY_MINOR_PAYLOAD_VERSION);
        for op in [SourceCopy, SourceBsdiff, BrotliBsdiff, Puffdiff, Zero, ReplaceXz] {
            assert!(v.operation_allowed(op), "{op}");
        }
        assert!(!v.operation_allowed(Move));
        assert!(!v.operation_allowed(Bsdiff));

        let v = PayloadVersion::new(MAJOR_PAYLOAD_VERSION, BROTLI_BSDIFF_MINOR_PAYLOAD_VERSION);
        assert!(v.operation_allowed(BrotliBsdiff));
        assert!(!v.operation_allowed(Puffdiff));
    }

    #[test]
    fn validate_rejects_unknown_versions() {
        assert!(PayloadVersion::new(2, 6).validate().is_ok());
        assert!(PayloadVersion::new(3, 2).validate().is_err());
        assert!(PayloadVersion::new(2, 7).validate().is_err());
    }

    #[test]
    fn no_source_types() {
        assert!(Zero.is_no_source());
        assert!(ReplaceXz.is_no_source());
        assert!(!SourceCopy.is_no_source());
        assert!(!Puffdiff.is_replace());
    }

    #[test]
    fn soft_chunk_is_capped_by_hard_chunk() {
        let config = Config::default();
        assert_eq!(config.soft_chunk_blocks(), 512);
        let config = Config {
            hard_chunk_blocks: Some(100),
            ..Config::default()
        };
        assert_eq!(config.soft_chunk_blocks(), 100);
    }

    struct SettingsFs(Settings);

    impl Filesystem for SettingsFs {
        fn block_size(&self) -> u64 {
            4096
        }
        fn block_count(&self) -> u64 {
            0
        }
        fn files(&self) -> Result<Vec<crate::filesystem::File>> {
            Ok(Vec::new())
        }
        fn load_settings(&self) -> Result<Settings> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn detect_minor_from_settings() {
        let raw = RawFilesystem::new(4096, 8);
        let fs = SettingsFs(crate::filesystem::parse_settings("PAYLOAD_MINOR_VERSION=4\n"));
        let detected = PayloadVersion::detect_minor(2, &[&raw, &fs]);
        assert_eq!(detected, PayloadVersion::new(2, 4));
        assert_eq!(PayloadVersion::detect_minor(2, &[&raw]).minor, INPLACE_MINOR_PAYLOAD_VERSION);
    }

    #[test]
    fn empty_blob_clears_data_fields() {
        let sink = MemoryBlob::new();
        let mut aop = AnnotatedOperation::new("file", InstallOperation::new(ReplaceBz));
        aop.set_operation_blob(b"payload", &sink).unwrap();
        assert_eq!(aop.op.data_offset, Some(0));
        assert_eq!(aop.op.data_length, Some(7));
        assert_eq!(aop.op.data_sha256_hash, Some(crate::sha256(b"payload")));

        aop.set_operation_blob(&[], &sink).unwrap();
        assert_eq!(aop.op.data_offset, None);
        assert_eq!(aop.op.data_sha256_hash, None);
        assert_eq!(sink.len(), 7);
    }
}
