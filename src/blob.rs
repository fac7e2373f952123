//! Append-only storage for operation data.

use std::io::Write;
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Location of a stored blob within the sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlobRef {
    pub offset: u64,
    pub length: u64,
}

/// Shared by every file unit of a partition run; `append` is called
/// concurrently and each call must get its own stable offset.
pub trait BlobSink: Send + Sync {
    fn append(&self, data: &[u8]) -> Result<BlobRef>;
}

struct Writer<W> {
    inner: W,
    offset: u64,
    /// Set when a write failed part way; the writer holds bytes no offset
    /// accounts for.
    failed: bool,
}

/// Blob sink over any writer, typically a temporary file.
pub struct BlobFile<W> {
    writer: Mutex<Writer<W>>,
}

impl<W: Write + Send> BlobFile<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: Mutex::new(Writer {
                inner,
                offset: 0,
                failed: false,
            }),
        }
    }

    /// Bytes written so far.
    pub fn size(&self) -> u64 {
        self.writer.lock().map_or_else(|e| e.into_inner().offset, |w| w.offset)
    }

    pub fn into_inner(self) -> Result<W> {
        let mut writer = self.writer.into_inner().map_err(|_| poisoned())?;
        if writer.failed {
            return Err(failed());
        }
        writer.inner.flush()?;
        Ok(writer.inner)
    }
}

impl<W: Write + Send> BlobSink for BlobFile<W> {
    fn append(&self, data: &[u8]) -> Result<BlobRef> {
        let mut writer = self.writer.lock().map_err(|_| poisoned())?;
        if writer.failed {
            return Err(failed());
        }
        if let Err(e) = writer.inner.write_all(data) {
            writer.failed = true;
            return Err(e.into());
        }
        let offset = writer.offset;
        writer.offset += data.len() as u64;
        Ok(BlobRef {
            offset,
            length: data.len() as u64,
        })
    }
}

/// In-memory blob sink.
#[derive(Default)]
pub struct MemoryBlob {
    data: Mutex<Vec<u8>>,
}

impl MemoryBlob {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u64 {
        self.data.lock().map_or_else(|e| e.into_inner().len(), |d| d.len()) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the stored bytes at `blob`.
    pub fn get(&self, blob: BlobRef) -> Option<Vec<u8>> {
        let data = self.data.lock().ok()?;
        let start = usize::try_from(blob.offset).ok()?;
        let end = start.checked_add(usize::try_from(blob.length).ok()?)?;
        data.get(start..end).map(<[u8]>::to_vec)
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl BlobSink for MemoryBlob {
    fn append(&self, data: &[u8]) -> Result<BlobRef> {
        let mut stored = self.data.lock().map_err(|_| poisoned())?;
        let offset = stored.len() as u64;
        stored.extend_from_slice(data);
        Ok(BlobRef {
            offset,
            length: data.len() as u64,
        })
    }
}

fn poisoned() -> Error {
    Error::Io(std::io::Error::other("blob sink lock poisoned"))
}

fn failed() -> Error {
    Error::Io(std::io::Error::other("blob sink failed on an earlier append"))
}
