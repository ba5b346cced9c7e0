//! # Log Page Codec
//!
//! A log page is one 4096-byte page recording which committed pages a commit
//! is about to overwrite and where their shadow copies live. Recovery uses
//! the pairs to restore the pre-commit image after a crash.
//!
//! ## Page Format
//!
//! ```text
//! Offset  Size    Description
//! ------  ------  -------------------------------------------
//! 0       8       magic: LOG_MAGIC, fixed bit pattern
//! 8       4       self_id: page index this log was written at
//! 12      4       count: number of pairs in use
//! 16      8       checksum: CRC64/ECMA-182 over self_id, count
//!                 and all 509 pair slots
//! 24      4072    pairs: 509 (original, copy) u32 pairs, LE
//! ```
//!
//! The layout fills the page exactly, so serialization is bit-stable across
//! runs. A log page identifies itself: recovery accepts a page as a log only
//! if the magic matches, the checksum validates, and `self_id` equals the
//! position the page was read from. The self-id check keeps a log page that
//! was copied elsewhere (e.g. into a shadow slot) from being misattributed.
//!
//! Commits larger than [`LOG_PAGE_MAX_PAIRS`] pairs span multiple log pages;
//! each page is self-contained.

use crc::{Crc, CRC_64_ECMA_182};
use eyre::Result;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{LOG_PAGE_MAX_PAIRS, PAGE_SIZE};

use super::{FileIo, PageIndex};

/// Identifies a page as a log page ("PKFSLOG1").
pub const LOG_MAGIC: u64 = u64::from_le_bytes(*b"PKFSLOG1");

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// One `(original, shadow copy)` entry of a log page.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct PagePair {
    original: U32,
    copy: U32,
}

impl PagePair {
    pub fn original(&self) -> PageIndex {
        self.original.get()
    }

    pub fn copy(&self) -> PageIndex {
        self.copy.get()
    }
}

/// A log page image, convertible to and from raw page bytes.
#[repr(C)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct LogPage {
    magic: U64,
    self_id: U32,
    count: U32,
    checksum: U64,
    pairs: [PagePair; LOG_PAGE_MAX_PAIRS],
}

const _: () = assert!(std::mem::size_of::<LogPage>() == PAGE_SIZE);

impl LogPage {
    /// An empty log destined for page `self_id`.
    pub fn new(self_id: PageIndex) -> Self {
        Self {
            magic: U64::new(LOG_MAGIC),
            self_id: U32::new(self_id),
            count: U32::new(0),
            checksum: U64::new(0),
            pairs: [PagePair {
                original: U32::new(0),
                copy: U32::new(0),
            }; LOG_PAGE_MAX_PAIRS],
        }
    }

    /// Append pairs until the page is full; returns how many were consumed.
    pub fn push_pairs(&mut self, pairs: &[(PageIndex, PageIndex)]) -> usize {
        let used = self.count.get() as usize;
        let take = pairs.len().min(LOG_PAGE_MAX_PAIRS - used);
        for (slot, &(original, copy)) in self.pairs[used..used + take].iter_mut().zip(pairs) {
            slot.original = U32::new(original);
            slot.copy = U32::new(copy);
        }
        self.count = U32::new((used + take) as u32);
        take
    }

    /// Stamp the checksum. Must be called after the last `push_pairs` and
    /// before the page is written out.
    pub fn seal(&mut self) {
        self.checksum = U64::new(self.compute_checksum());
    }

    /// Parse `bytes` read from page `position`; `None` unless they positively
    /// identify a sealed log page written at that position.
    pub fn parse(bytes: &[u8], position: PageIndex) -> Option<Self> {
        let page = Self::read_from_bytes(bytes).ok()?;
        if page.magic.get() != LOG_MAGIC
            || page.self_id.get() != position
            || page.count.get() as usize > LOG_PAGE_MAX_PAIRS
            || page.checksum.get() != page.compute_checksum()
        {
            return None;
        }
        Some(page)
    }

    pub fn self_id(&self) -> PageIndex {
        self.self_id.get()
    }

    /// The pairs in use.
    pub fn pairs(&self) -> &[PagePair] {
        &self.pairs[..self.count.get() as usize]
    }

    fn compute_checksum(&self) -> u64 {
        let mut digest = CRC64.digest();
        digest.update(self.self_id.as_bytes());
        digest.update(self.count.as_bytes());
        digest.update(self.pairs.as_bytes());
        digest.finalize()
    }
}

/// Collect the `(original, copy)` pairs of every log page at the file's tail.
///
/// Log pages are only ever the trailing pages of a file (they are written
/// last during a commit), so the scan walks backwards from the end and stops
/// at the first page that is not a log. An empty result means the file holds
/// no interrupted commit.
pub fn read_log_pairs(file: &dyn FileIo) -> Result<Vec<(PageIndex, PageIndex)>> {
    let mut pairs = Vec::new();
    let mut buf = [0u8; PAGE_SIZE];

    for position in (0..file.page_count() as PageIndex).rev() {
        file.read_page(position, 0, &mut buf)?;
        let Some(log) = LogPage::parse(&buf, position) else {
            break;
        };
        pairs.extend(log.pairs().iter().map(|p| (p.original(), p.copy())));
    }

    Ok(pairs)
}
