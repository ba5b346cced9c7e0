//! # Memory-Mapped Backing File
//!
//! `MmapFile` is the on-disk [`FileIo`] implementation: one host file mapped
//! into the address space, in whole-page units.
//!
//! ## Design
//!
//! The mapping is remapped on every size change (`new_interval`, `truncate`).
//! Size changes and page writes take the interior write lock; page reads take
//! the read lock, so concurrent readers never observe a mapping mid-swap.
//!
//! `flush()` is the commit protocol's durability barrier: it `msync`s the
//! mapping and then `fsync`s the file so size changes (interval allocation,
//! truncation) are durable too. The commit handler's log-retirement step
//! depends on truncation being durable, not just the page bytes.
//!
//! ## Open Modes
//!
//! - `Create`: new or truncated file, read-write
//! - `Open`: existing file, read-write
//! - `ReadOnly`: existing file, shared access; all mutation returns an error
//!   and `default_access()` hands out a read token

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::{Mmap, MmapMut};
use parking_lot::RwLock;

use super::{Access, FileIo, Interval, LockProtocol, PageIndex, PAGE_SIZE};

/// How to open the host file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Create,
    Open,
    ReadOnly,
}

enum Map {
    /// Zero-length files cannot be mapped.
    Empty,
    Ro(Mmap),
    Rw(MmapMut),
}

impl Map {
    fn as_slice(&self) -> &[u8] {
        match self {
            Map::Empty => &[],
            Map::Ro(m) => m,
            Map::Rw(m) => m,
        }
    }
}

struct MmapInner {
    file: File,
    map: Map,
    page_count: usize,
}

/// A backing file on disk, accessed through a memory mapping.
pub struct MmapFile {
    inner: RwLock<MmapInner>,
    lock_protocol: LockProtocol,
    writable: bool,
    path: PathBuf,
}

impl MmapFile {
    /// Create a new (or truncate an existing) host file.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_mode(path, OpenMode::Create)
    }

    /// Open an existing host file read-write.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_mode(path, OpenMode::Open)
    }

    /// Open an existing host file read-only.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_mode(path, OpenMode::ReadOnly)
    }

    pub fn open_mode<P: AsRef<Path>>(path: P, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref();
        let writable = mode != OpenMode::ReadOnly;

        let file = match mode {
            OpenMode::Create => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path),
            OpenMode::Open => OpenOptions::new().read(true).write(true).open(path),
            OpenMode::ReadOnly => OpenOptions::new().read(true).open(path),
        }
        .wrap_err_with(|| format!("failed to open host file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat host file '{}'", path.display()))?
            .len();

        ensure!(
            file_size % PAGE_SIZE as u64 == 0,
            "host file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            PAGE_SIZE
        );

        let map = Self::map_file(&file, file_size, writable)
            .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?;

        Ok(Self {
            inner: RwLock::new(MmapInner {
                file,
                map,
                page_count: (file_size / PAGE_SIZE as u64) as usize,
            }),
            lock_protocol: LockProtocol::new(),
            writable,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn map_file(file: &File, file_size: u64, writable: bool) -> Result<Map> {
        if file_size == 0 {
            return Ok(Map::Empty);
        }

        if writable {
            // SAFETY: mapping a file mutably is unsafe because external
            // modification of the file is undefined behavior. This is safe
            // because the host file is owned by this process for the lifetime
            // of the MmapFile: packfs is a single-file container and the lock
            // protocol serializes all writers within the process. All access
            // is bounds-checked against page_count before touching the map.
            let map = unsafe { MmapMut::map_mut(file)? };
            Ok(Map::Rw(map))
        } else {
            // SAFETY: as above; the read-only mapping additionally never
            // mutates the region.
            let map = unsafe { Mmap::map(file)? };
            Ok(Map::Ro(map))
        }
    }

    /// Flush the current mapping and swap it for one matching `new_pages`.
    fn remap(&self, inner: &mut MmapInner, new_pages: usize) -> Result<()> {
        if let Map::Rw(m) = &inner.map {
            m.flush().wrap_err("failed to flush mapping before remap")?;
        }

        inner
            .file
            .set_len((new_pages * PAGE_SIZE) as u64)
            .wrap_err_with(|| format!("failed to resize host file to {} pages", new_pages))?;

        inner.map = Self::map_file(&inner.file, (new_pages * PAGE_SIZE) as u64, self.writable)?;
        inner.page_count = new_pages;
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        ensure!(
            self.writable,
            "host file '{}' was opened read-only",
            self.path.display()
        );
        Ok(())
    }
}

impl FileIo for MmapFile {
    fn new_interval(&self, count: usize) -> Result<Interval> {
        self.ensure_writable()?;
        let mut inner = self.inner.write();
        let begin = inner.page_count as PageIndex;
        ensure!(
            inner.page_count + count < super::INVALID_PAGE as usize,
            "file would exceed the addressable page range"
        );
        let new_pages = inner.page_count + count;
        self.remap(&mut inner, new_pages)?;
        Ok(Interval::new(begin, begin + count as PageIndex))
    }

    fn read_page(&self, id: PageIndex, offset: usize, buf: &mut [u8]) -> Result<()> {
        assert!(
            offset + buf.len() <= PAGE_SIZE,
            "read range crosses the page boundary"
        );
        let inner = self.inner.read();
        ensure!(
            (id as usize) < inner.page_count,
            "read of page {} beyond file size of {} pages",
            id,
            inner.page_count
        );
        let start = id as usize * PAGE_SIZE + offset;
        buf.copy_from_slice(&inner.map.as_slice()[start..start + buf.len()]);
        Ok(())
    }

    fn write_page(&self, id: PageIndex, offset: usize, data: &[u8]) -> Result<()> {
        assert!(
            offset + data.len() <= PAGE_SIZE,
            "write range crosses the page boundary"
        );
        self.ensure_writable()?;
        let mut inner = self.inner.write();
        ensure!(
            (id as usize) < inner.page_count,
            "write of page {} beyond file size of {} pages",
            id,
            inner.page_count
        );
        let start = id as usize * PAGE_SIZE + offset;
        match &mut inner.map {
            Map::Rw(m) => m[start..start + data.len()].copy_from_slice(data),
            _ => bail!("host file mapping is not writable"),
        }
        Ok(())
    }

    fn page_count(&self) -> usize {
        self.inner.read().page_count
    }

    fn flush(&self) -> Result<()> {
        let inner = self.inner.read();
        if let Map::Rw(m) = &inner.map {
            m.flush().wrap_err("failed to flush mapping")?;
        }
        // set_len changes are metadata; msync alone does not cover them
        inner
            .file
            .sync_all()
            .wrap_err("failed to sync host file metadata")?;
        Ok(())
    }

    fn truncate(&self, pages: usize) -> Result<()> {
        self.ensure_writable()?;
        let mut inner = self.inner.write();
        ensure!(
            pages <= inner.page_count,
            "truncate to {} pages would grow the file ({} pages)",
            pages,
            inner.page_count
        );
        self.remap(&mut inner, pages)
    }

    fn lock_protocol(&self) -> &LockProtocol {
        &self.lock_protocol
    }

    fn default_access(&self) -> Access<'_> {
        if self.writable {
            Access::Write(self.lock_protocol.write_access())
        } else {
            Access::Read(self.lock_protocol.read_access())
        }
    }
}
