//! Random-access reads from partition images.

use std::io;

use crate::error::Result;
use crate::extent::Extent;

/// A partition image that can be read at arbitrary offsets from many threads.
pub trait Image: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`; returns 0 at end of image.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("image ends before byte {offset}"),
                    ));
                }
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
impl Image for std::fs::File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }
}

#[cfg(windows)]
impl Image for std::fs::File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buf, offset)
    }
}

impl Image for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let Some(rest) = usize::try_from(offset).ok().and_then(|o| self.get(o..)) else {
            return Ok(0);
        };
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        Ok(n)
    }
}

/// Reads `extents` back to back. Holes read as zeros.
pub fn read_extents(image: &dyn Image, extents: &[Extent], block_size: u64) -> Result<Vec<u8>> {
    let total: u64 = extents.iter().map(|e| e.num_blocks * block_size).sum();
    let mut data = vec![0u8; total as usize];
    let mut pos = 0usize;
    for extent in extents {
        let len = (extent.num_blocks * block_size) as usize;
        if !extent.is_hole() {
            image.read_exact_at(&mut data[pos..pos + len], extent.start_block * block_size)?;
        }
        pos += len;
    }
    Ok(data)
}
