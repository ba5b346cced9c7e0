//! # Commit Handler
//!
//! Turns the transaction a [`PageCache`](super::PageCache) hands over into
//! the next committed state of the file, atomically with respect to a crash
//! at any instant.
//!
//! ## Protocol
//!
//! The originals of all dirty pages still hold the previous committed
//! contents (that is what the dirty page protocol bought us). The handler
//! spends that guarantee in a fixed order:
//!
//! ```text
//! 1. collect dirty ids        redirection keys + resident Dirty entries
//! 2. shadow-copy originals    file-to-file, into a fresh interval
//! 3. flush                    shadows durable before any log mentions them
//! 4. write log pages          (original, copy) pairs, self-identifying
//! 5. flush                    logs durable before originals are touched
//! 6. overwrite originals      from cache if resident, else diverted copy
//! 7. write remaining pages    resident New entries, in place
//! 8. flush                    the new committed state is durable
//! 9. truncate + flush         retire shadows and logs
//! ```
//!
//! The crash semantics pivot at step 5: before that flush returns, recovery
//! finds no complete log tail and leaves the old state alone; after it, the
//! durable logs let recovery restore every original from its shadow. Either
//! way the file reopens as exactly one committed image, never a mixture.
//!
//! Step 9 is what retires the undo information. If the truncation were not
//! durable before `commit` returns, a later open could replay the logs of a
//! commit that already succeeded and roll it back, so the handler pays one
//! more flush to fence it.
//!
//! A transaction with no dirty pages has nothing to fence: its new pages are
//! invisible to the previous committed state, so they are written in place
//! and flushed, and no shadows or logs are produced.

use std::sync::Arc;

use eyre::{ensure, Result};
use smallvec::SmallVec;
use tracing::debug;

use super::cache::{PageClass, TransactionState};
use super::log::{read_log_pairs, LogPage};
use super::{copy_page, FileIo, PageIndex};

use zerocopy::IntoBytes;

/// Owns a transaction's moved-out state and commits it to the file.
pub struct CommitHandler {
    file: Arc<dyn FileIo>,
    state: TransactionState,
}

impl CommitHandler {
    pub(crate) fn new(file: Arc<dyn FileIo>, state: TransactionState) -> Self {
        Self { file, state }
    }

    /// The diverted locations dirty pages were evicted to.
    pub fn diverted_page_ids(&self) -> Vec<PageIndex> {
        self.state.diverted.values().copied().collect()
    }

    /// Original ids of every page following the dirty page protocol: the
    /// redirected ones plus those still resident as `Dirty`.
    pub fn dirty_page_ids(&self) -> Vec<PageIndex> {
        let mut ids: Vec<PageIndex> = self.state.diverted.keys().copied().collect();
        ids.extend(
            self.state
                .entries
                .iter()
                .filter(|(_, e)| e.class == PageClass::Dirty)
                .map(|(&id, _)| id),
        );
        ids
    }

    /// Run the commit protocol; see the module docs for the exact ordering.
    pub fn commit(mut self) -> Result<()> {
        let dirty = self.dirty_page_ids();
        debug!(
            dirty = dirty.len(),
            resident = self.state.entries.len(),
            diverted = self.state.diverted.len(),
            "commit.begin"
        );

        if dirty.is_empty() {
            // nothing committed is being replaced; new pages only
            self.write_cached_pages()?;
            self.file.flush()?;
            debug!("commit.done_without_fencing");
            return Ok(());
        }

        let size_before = self.file.page_count();

        // order the file writes: shadows must be visible before the logs
        let pairs = self.copy_dirty_pages(&dirty)?;
        self.file.flush()?;

        // and the logs before any original is overwritten
        self.write_logs(&pairs)?;
        self.file.flush()?;
        debug!(pairs = pairs.len(), "commit.logs_durable");

        self.update_dirty_pages(&dirty)?;
        self.write_cached_pages()?;
        self.file.flush()?;

        // retire shadows and logs; durable, or a later open would undo us
        self.file.truncate(size_before)?;
        self.file.flush()?;
        debug!(pages = size_before, "commit.complete");
        Ok(())
    }

    /// Copy the committed contents of every dirty page into a freshly
    /// allocated shadow interval, returning the `(original, copy)` pairs.
    fn copy_dirty_pages(&self, dirty: &[PageIndex]) -> Result<Vec<(PageIndex, PageIndex)>> {
        let iv = self.file.new_interval(dirty.len())?;
        ensure!(
            iv.len() == dirty.len(),
            "shadow interval allocation returned {} pages instead of {}",
            iv.len(),
            dirty.len()
        );

        let mut pairs = Vec::with_capacity(dirty.len());
        for (&original, copy) in dirty.iter().zip(iv.iter()) {
            copy_page(&*self.file, original, copy)?;
            pairs.push((original, copy));
        }
        Ok(pairs)
    }

    /// Encode `pairs` into as many log pages as needed, each written to a
    /// freshly extended page.
    pub fn write_logs(&self, pairs: &[(PageIndex, PageIndex)]) -> Result<()> {
        let mut rest = pairs;
        while !rest.is_empty() {
            let id = self.file.new_interval(1)?.begin();
            let mut log = LogPage::new(id);
            let taken = log.push_pairs(rest);
            rest = &rest[taken..];
            log.seal();
            self.file.write_page(id, 0, log.as_bytes())?;
        }
        Ok(())
    }

    /// The `(original, copy)` pairs of any log pages at the file's tail.
    pub fn read_logs(&self) -> Result<Vec<(PageIndex, PageIndex)>> {
        read_log_pairs(&*self.file)
    }

    /// Overwrite each dirty original with its transaction contents: from the
    /// cache when the page is resident (it may carry updates newer than its
    /// diverted copy), otherwise file-to-file from the diverted location.
    fn update_dirty_pages(&mut self, dirty: &[PageIndex]) -> Result<()> {
        for &original in dirty {
            let effective = self.divert(original);
            match self.state.entries.remove(&effective) {
                Some(entry) => {
                    self.file.write_page(original, 0, entry.buf.as_slice())?;
                }
                None => {
                    // a Dirty page is either resident or diverted
                    assert!(
                        effective != original,
                        "dirty page {} is neither resident nor diverted",
                        original
                    );
                    copy_page(&*self.file, effective, original)?;
                }
            }
        }
        Ok(())
    }

    /// Write every remaining non-`Read` resident page to its own id.
    fn write_cached_pages(&mut self) -> Result<()> {
        let mut written: SmallVec<[PageIndex; 32]> = SmallVec::new();
        for (&id, entry) in self.state.entries.iter() {
            if entry.class != PageClass::Read {
                self.file.write_page(id, 0, entry.buf.as_slice())?;
                written.push(id);
            }
        }
        self.state.entries.clear();
        debug!(pages = written.len(), "commit.cached_pages_written");
        Ok(())
    }

    /// Where `id`'s contents currently live: its diverted location, or `id`
    /// itself if it was never diverted.
    fn divert(&self, id: PageIndex) -> PageIndex {
        match self.state.diverted.get(&id) {
            Some(&moved) => moved,
            None => id,
        }
    }

    /// Hand the backing file back without committing; the transaction is
    /// discarded.
    pub fn into_file(self) -> Arc<dyn FileIo> {
        self.file
    }
}
