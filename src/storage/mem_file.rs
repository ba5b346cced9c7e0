//! # In-Memory Backing File
//!
//! `MemFile` is the reference [`FileIo`] implementation: a growable byte
//! vector behind an `RwLock`. It backs unit tests, ephemeral filesystems and
//! the crash-simulation harness, which snapshots and restores whole images.

use eyre::{ensure, Result};
use parking_lot::RwLock;

use super::{FileIo, Interval, LockProtocol, PageIndex, PAGE_SIZE};

/// A backing file living entirely in memory.
pub struct MemFile {
    data: RwLock<Vec<u8>>,
    lock_protocol: LockProtocol,
}

impl MemFile {
    /// An empty file of zero pages.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(Vec::new()),
            lock_protocol: LockProtocol::new(),
        }
    }

    /// Reconstruct a file from a raw image, e.g. a crash-test snapshot.
    ///
    /// The image length must be a multiple of the page size.
    pub fn from_image(image: Vec<u8>) -> Result<Self> {
        ensure!(
            image.len() % PAGE_SIZE == 0,
            "image size {} is not a multiple of page size {}",
            image.len(),
            PAGE_SIZE
        );
        Ok(Self {
            data: RwLock::new(image),
            lock_protocol: LockProtocol::new(),
        })
    }

    /// A copy of the current byte image.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl Default for MemFile {
    fn default() -> Self {
        Self::new()
    }
}

impl FileIo for MemFile {
    fn new_interval(&self, count: usize) -> Result<Interval> {
        let mut data = self.data.write();
        let begin = (data.len() / PAGE_SIZE) as PageIndex;
        ensure!(
            begin as usize + count < super::INVALID_PAGE as usize,
            "file would exceed the addressable page range"
        );
        let new_len = data.len() + count * PAGE_SIZE;
        data.resize(new_len, 0);
        Ok(Interval::new(begin, begin + count as PageIndex))
    }

    fn read_page(&self, id: PageIndex, offset: usize, buf: &mut [u8]) -> Result<()> {
        assert!(
            offset + buf.len() <= PAGE_SIZE,
            "read range crosses the page boundary"
        );
        let data = self.data.read();
        let start = id as usize * PAGE_SIZE + offset;
        ensure!(
            (id as usize + 1) * PAGE_SIZE <= data.len(),
            "read of page {} beyond file size of {} pages",
            id,
            data.len() / PAGE_SIZE
        );
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_page(&self, id: PageIndex, offset: usize, data_in: &[u8]) -> Result<()> {
        assert!(
            offset + data_in.len() <= PAGE_SIZE,
            "write range crosses the page boundary"
        );
        let mut data = self.data.write();
        ensure!(
            (id as usize + 1) * PAGE_SIZE <= data.len(),
            "write of page {} beyond file size of {} pages",
            id,
            data.len() / PAGE_SIZE
        );
        let start = id as usize * PAGE_SIZE + offset;
        data[start..start + data_in.len()].copy_from_slice(data_in);
        Ok(())
    }

    fn read_pages(&self, iv: Interval, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        let start = iv.begin() as usize * PAGE_SIZE;
        let len = iv.len() * PAGE_SIZE;
        ensure!(
            iv.end() as usize * PAGE_SIZE <= data.len(),
            "read of pages {}..{} beyond file size of {} pages",
            iv.begin(),
            iv.end(),
            data.len() / PAGE_SIZE
        );
        buf[..len].copy_from_slice(&data[start..start + len]);
        Ok(())
    }

    fn write_pages(&self, iv: Interval, buf: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        let start = iv.begin() as usize * PAGE_SIZE;
        let len = iv.len() * PAGE_SIZE;
        ensure!(
            iv.end() as usize * PAGE_SIZE <= data.len(),
            "write of pages {}..{} beyond file size of {} pages",
            iv.begin(),
            iv.end(),
            data.len() / PAGE_SIZE
        );
        data[start..start + len].copy_from_slice(&buf[..len]);
        Ok(())
    }

    fn page_count(&self) -> usize {
        self.data.read().len() / PAGE_SIZE
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn truncate(&self, pages: usize) -> Result<()> {
        let mut data = self.data.write();
        ensure!(
            pages * PAGE_SIZE <= data.len(),
            "truncate to {} pages would grow the file ({} pages)",
            pages,
            data.len() / PAGE_SIZE
        );
        data.truncate(pages * PAGE_SIZE);
        Ok(())
    }

    fn lock_protocol(&self) -> &LockProtocol {
        &self.lock_protocol
    }
}
