//! # Transactional Page Cache
//!
//! The choke point between every consumer of pages and the backing file. The
//! cache is simultaneously a bounded buffer pool front-end, the bookkeeper of
//! the dirty page protocol, and the place where a transaction's state lives
//! until commit hands it off.
//!
//! ## Page Classes
//!
//! Every resident page carries a class that decides its eviction and commit
//! behavior:
//!
//! - `Read`: faithful image of a committed page; evicting it is free.
//! - `Dirty`: modified since the last commit. The committed original on disk
//!   must survive until commit fencing completes, so eviction writes the
//!   buffer to a freshly allocated page and records a redirection
//!   `original → diverted`. Later loads of the original follow the
//!   redirection transparently.
//! - `New`: allocated inside the current transaction. The on-disk page has no
//!   committed predecessor, so eviction writes the buffer in place.
//!
//! ## Pinning
//!
//! Handles ([`PageRef`], [`PageMut`]) pin their entry; pinned entries are
//! never evicted and their buffers never move. All byte access goes through
//! the handle and briefly takes the cache lock, which keeps the unsafe
//! surface of raw buffer sharing out of the core entirely.
//!
//! ## Eviction
//!
//! `trim(target)` keeps the `target` most-used unpinned entries, evicting the
//! rest lowest-usage-first, processing `Dirty` before `New` before `Read` so
//! redirections are allocated before plain writebacks. `trim_check` runs
//! after every insertion and trims to 3/4 of `max_pages` when the cache
//! overflows.
//!
//! ## Commit Handoff
//!
//! [`PageCache::build_commit_handler`] moves the cache map, redirection map
//! and new-page set out into a [`CommitHandler`]; the cache is empty and
//! reusable once the handler is done. There is no shared mutable state
//! between the two phases.

use std::sync::Arc;

use eyre::Result;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::trace;

use crate::config::DEFAULT_MAX_CACHED_PAGES;
use crate::memory::{PagePool, PooledBuf};

use super::commit::CommitHandler;
use super::{recovery, FileIo, Interval, PageIndex};

/// How a resident page relates to the committed state on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageClass {
    /// Unmodified image of a committed page.
    Read,
    /// Modified image of a committed page; the original must not be
    /// overwritten before commit fencing.
    Dirty,
    /// Page allocated within the current transaction.
    New,
}

pub(crate) struct CacheEntry {
    pub(crate) buf: PooledBuf,
    pub(crate) class: PageClass,
    usage: u64,
    pins: u32,
}

/// The transactional state a commit takes over from the cache.
pub(crate) struct TransactionState {
    pub(crate) entries: HashMap<PageIndex, CacheEntry>,
    pub(crate) diverted: HashMap<PageIndex, PageIndex>,
    pub(crate) new_pages: HashSet<PageIndex>,
}

type IntervalHook = Box<dyn FnMut(usize) -> Option<Interval> + Send>;

struct CacheInner {
    entries: HashMap<PageIndex, CacheEntry>,
    diverted: HashMap<PageIndex, PageIndex>,
    new_pages: HashSet<PageIndex>,
    interval_hook: Option<IntervalHook>,
}

/// The transactional page cache over one backing file.
pub struct PageCache {
    file: Arc<dyn FileIo>,
    pool: PagePool,
    max_pages: usize,
    inner: Mutex<CacheInner>,
}

struct EvictCandidate {
    usage: u64,
    class: PageClass,
    id: PageIndex,
}

impl PageCache {
    /// A cache over `file` with the default resident-page bound. No recovery
    /// is attempted; use [`PageCache::open`] for files that may carry an
    /// interrupted commit.
    pub fn new(file: Arc<dyn FileIo>) -> Self {
        Self::with_max_pages(file, DEFAULT_MAX_CACHED_PAGES)
    }

    pub fn with_max_pages(file: Arc<dyn FileIo>, max_pages: usize) -> Self {
        Self {
            pool: PagePool::new(max_pages),
            max_pages,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                diverted: HashMap::new(),
                new_pages: HashSet::new(),
                interval_hook: None,
            }),
            file,
        }
    }

    /// Open a file that may hold the log pages of an interrupted commit:
    /// recovery runs before the cache accepts any traffic.
    pub fn open(file: Arc<dyn FileIo>) -> Result<Self> {
        recovery::recover(&*file)?;
        Ok(Self::new(file))
    }

    pub fn open_with_max_pages(file: Arc<dyn FileIo>, max_pages: usize) -> Result<Self> {
        recovery::recover(&*file)?;
        Ok(Self::with_max_pages(file, max_pages))
    }

    /// The backing file this cache mediates.
    pub fn file(&self) -> &Arc<dyn FileIo> {
        &self.file
    }

    /// Give up the cache and hand the backing file back, e.g. to reopen it
    /// elsewhere. Transactional state still resident is discarded.
    pub fn into_file(self) -> Arc<dyn FileIo> {
        self.file
    }

    /// Deliver a fresh writable page allocated for this transaction.
    ///
    /// The id comes from the installed page-interval allocator if one is
    /// active, otherwise from extending the file. Buffer contents are
    /// unspecified; callers are expected to overwrite them.
    pub fn new_page(&self) -> Result<PageMut<'_>> {
        let mut inner = self.inner.lock();
        let guard = &mut *inner;
        let id = next_index(&mut guard.interval_hook, &*self.file)?;
        let buf = self.pool.acquire();
        guard.entries.insert(
            id,
            CacheEntry {
                buf,
                class: PageClass::New,
                usage: 0,
                pins: 1,
            },
        );
        guard.new_pages.insert(id);
        self.trim_check(guard)?;
        Ok(PageMut {
            cache: self,
            id,
            key: id,
        })
    }

    /// Load a page left behind by a previous transaction (or this one).
    ///
    /// Redirection is applied internally; the returned handle reports the id
    /// the caller asked for. The handle is read-only — pages modified through
    /// [`PageCache::make_page_writable`] enter the dirty page protocol.
    pub fn load_page(&self, id: PageIndex) -> Result<PageRef<'_>> {
        let mut inner = self.inner.lock();
        let guard = &mut *inner;
        let key = redirect(&guard.diverted, id);

        if let Some(entry) = guard.entries.get_mut(&key) {
            entry.usage += 1;
            entry.pins += 1;
            return Ok(PageRef {
                cache: self,
                id,
                key,
            });
        }

        let mut buf = self.pool.acquire();
        self.file.read_page(key, 0, buf.as_mut_slice())?;
        let class = if guard.new_pages.contains(&key) {
            PageClass::New
        } else {
            PageClass::Read
        };
        guard.entries.insert(
            key,
            CacheEntry {
                buf,
                class,
                usage: 0,
                pins: 1,
            },
        );
        self.trim_check(guard)?;
        Ok(PageRef {
            cache: self,
            id,
            key,
        })
    }

    /// Reuse a page id for entirely new contents: like [`PageCache::load_page`]
    /// without the physical read, already writable.
    ///
    /// The entry is `New` if the effective id belongs to this transaction,
    /// `Dirty` otherwise. Pages managed by a free store must not come through
    /// here — their recycled ids re-enter via the interval allocator instead.
    pub fn repurpose(&self, id: PageIndex) -> Result<PageMut<'_>> {
        let mut inner = self.inner.lock();
        let guard = &mut *inner;
        let key = redirect(&guard.diverted, id);
        let class = if guard.new_pages.contains(&key) {
            PageClass::New
        } else {
            PageClass::Dirty
        };

        if let Some(entry) = guard.entries.get_mut(&key) {
            entry.usage += 1;
            entry.pins += 1;
            entry.class = class;
            return Ok(PageMut {
                cache: self,
                id,
                key,
            });
        }

        let buf = self.pool.acquire();
        guard.entries.insert(
            key,
            CacheEntry {
                buf,
                class,
                usage: 0,
                pins: 1,
            },
        );
        self.trim_check(guard)?;
        Ok(PageMut {
            cache: self,
            id,
            key,
        })
    }

    /// Transform a loaded page into a writable one, entering the dirty page
    /// protocol. The buffer is shared, not copied.
    pub fn make_page_writable<'a>(&'a self, page: PageRef<'a>) -> PageMut<'a> {
        self.set_page_dirty(page.id);
        let handle = PageMut {
            cache: self,
            id: page.id,
            key: page.key,
        };
        // the pin moves to the new handle
        std::mem::forget(page);
        handle
    }

    /// Record that a resident page was changed: previously committed pages
    /// become `Dirty`, pages of this transaction stay `New`.
    ///
    /// Panics if the page is not resident — only cached pages can be marked.
    pub fn set_page_dirty(&self, id: PageIndex) {
        let mut inner = self.inner.lock();
        let guard = &mut *inner;
        let key = redirect(&guard.diverted, id);
        let class = if guard.new_pages.contains(&key) {
            PageClass::New
        } else {
            PageClass::Dirty
        };
        let entry = guard
            .entries
            .get_mut(&key)
            .expect("set_page_dirty on a page that is not resident");
        entry.class = class;
    }

    /// Evict unpinned pages until at most `target` of them remain resident,
    /// lowest usage first. Returns the resulting cache size (which still
    /// includes every pinned page).
    pub fn trim(&self, target: usize) -> Result<usize> {
        let mut inner = self.inner.lock();
        self.trim_locked(&mut inner, target)
    }

    /// Number of resident entries.
    pub fn cached_pages(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Current size of the backing file in pages.
    pub fn page_count(&self) -> usize {
        self.file.page_count()
    }

    /// Install the recycled-id source consulted by page allocation, e.g. a
    /// free store handing out pages released in an earlier transaction.
    ///
    /// The hook stays installed until it signals exhaustion (`None` or an
    /// empty interval) or the transaction ends; after exhaustion, allocation
    /// falls back to extending the file for the rest of the transaction.
    pub fn set_page_interval_allocator(
        &self,
        alloc: impl FnMut(usize) -> Option<Interval> + Send + 'static,
    ) {
        self.inner.lock().interval_hook = Some(Box::new(alloc));
    }

    /// Move the transaction (cache map, redirections, new-page set) into a
    /// [`CommitHandler`]. The cache is empty afterwards and stays usable for
    /// the next transaction once the handler has run.
    pub fn build_commit_handler(&mut self) -> CommitHandler {
        let inner = self.inner.get_mut();
        inner.interval_hook = None;
        let state = TransactionState {
            entries: std::mem::take(&mut inner.entries),
            diverted: std::mem::take(&mut inner.diverted),
            new_pages: std::mem::take(&mut inner.new_pages),
        };
        CommitHandler::new(Arc::clone(&self.file), state)
    }

    /// Commit the current transaction; see [`CommitHandler::commit`] for the
    /// protocol. On error the transactional state is discarded and the
    /// on-disk committed image is settled by recovery on next open.
    pub fn commit(&mut self) -> Result<()> {
        self.build_commit_handler().commit()
    }

    /// Throw the current transaction away: every resident page, redirection
    /// and new-page record is dropped.
    pub fn abort(&mut self) {
        let inner = self.inner.get_mut();
        inner.entries.clear();
        inner.diverted.clear();
        inner.new_pages.clear();
        inner.interval_hook = None;
    }

    /// The `(original, copy)` pairs of any log pages at the file's tail.
    pub fn read_logs(&self) -> Result<Vec<(PageIndex, PageIndex)>> {
        super::log::read_log_pairs(&*self.file)
    }

    fn trim_check(&self, inner: &mut CacheInner) -> Result<()> {
        if inner.entries.len() > self.max_pages {
            self.trim_locked(inner, self.max_pages / 4 * 3)?;
        }
        Ok(())
    }

    fn trim_locked(&self, inner: &mut CacheInner, target: usize) -> Result<usize> {
        let guard = &mut *inner;

        let mut unpinned: SmallVec<[EvictCandidate; 32]> = guard
            .entries
            .iter()
            .filter(|(_, e)| e.pins == 0)
            .map(|(&id, e)| EvictCandidate {
                usage: e.usage,
                class: e.class,
                id,
            })
            .collect();

        if unpinned.len() <= target {
            return Ok(guard.entries.len());
        }

        // keep the `target` most-used entries
        unpinned.sort_unstable_by_key(|c| std::cmp::Reverse(c.usage));
        let evict = &unpinned[target..];

        // Dirty evictions allocate their diversion targets before any plain
        // writeback happens, so the redirection map is complete if a later
        // write fails and the transaction aborts.
        for cand in evict.iter().filter(|c| c.class == PageClass::Dirty) {
            let entry = guard
                .entries
                .get(&cand.id)
                .expect("eviction candidate is resident");
            let copy_id = next_index(&mut guard.interval_hook, &*self.file)?;
            self.file.write_page(copy_id, 0, entry.buf.as_slice())?;
            guard.diverted.insert(cand.id, copy_id);
            guard.new_pages.insert(copy_id);
        }

        for cand in evict.iter().filter(|c| c.class == PageClass::New) {
            let entry = guard
                .entries
                .get(&cand.id)
                .expect("eviction candidate is resident");
            self.file.write_page(cand.id, 0, entry.buf.as_slice())?;
        }

        for cand in evict {
            guard.entries.remove(&cand.id);
        }

        trace!(
            evicted = evict.len(),
            resident = guard.entries.len(),
            "cache.trimmed"
        );
        Ok(guard.entries.len())
    }

    fn read_entry(&self, key: PageIndex, offset: usize, out: &mut [u8]) {
        let inner = self.inner.lock();
        let entry = inner
            .entries
            .get(&key)
            .expect("a pinned page is always resident");
        out.copy_from_slice(&entry.buf[offset..offset + out.len()]);
    }

    fn with_entry<R>(&self, key: PageIndex, f: impl FnOnce(&[u8]) -> R) -> R {
        let inner = self.inner.lock();
        let entry = inner
            .entries
            .get(&key)
            .expect("a pinned page is always resident");
        f(&entry.buf[..])
    }

    fn write_entry(&self, key: PageIndex, offset: usize, data: &[u8]) {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(&key)
            .expect("a pinned page is always resident");
        entry.buf[offset..offset + data.len()].copy_from_slice(data);
    }

    fn with_entry_mut<R>(&self, key: PageIndex, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(&key)
            .expect("a pinned page is always resident");
        f(&mut entry.buf[..])
    }

    fn unpin(&self, key: PageIndex) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&key) {
            debug_assert!(entry.pins > 0, "unpin of an unpinned page");
            entry.pins -= 1;
        }
    }
}

fn redirect(diverted: &HashMap<PageIndex, PageIndex>, id: PageIndex) -> PageIndex {
    match diverted.get(&id) {
        Some(&moved) => moved,
        None => id,
    }
}

/// Pick the next fresh page id: from the installed recycled-id source while
/// it has pages, from extending the file once it is exhausted.
fn next_index(hook: &mut Option<IntervalHook>, file: &dyn FileIo) -> Result<PageIndex> {
    if let Some(alloc) = hook.as_mut() {
        match alloc(1) {
            Some(iv) if !iv.is_empty() => return Ok(iv.begin()),
            // exhausted; stop consulting it for the rest of the transaction
            _ => *hook = None,
        }
    }
    Ok(file.new_interval(1)?.begin())
}

/// Read-only handle to a resident page. Pins the page until dropped.
pub struct PageRef<'a> {
    cache: &'a PageCache,
    id: PageIndex,
    key: PageIndex,
}

impl PageRef<'_> {
    /// The page id the caller asked for (diversion stays internal).
    pub fn id(&self) -> PageIndex {
        self.id
    }

    /// Copy `out.len()` bytes starting at `offset` out of the page.
    pub fn read(&self, offset: usize, out: &mut [u8]) {
        self.cache.read_entry(self.key, offset, out)
    }

    pub fn read_byte(&self, offset: usize) -> u8 {
        let mut b = [0u8; 1];
        self.read(offset, &mut b);
        b[0]
    }

    /// Run `f` over the page contents without copying. The cache lock is
    /// held for the duration, so `f` must not call back into the cache.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.cache.with_entry(self.key, f)
    }
}

impl Drop for PageRef<'_> {
    fn drop(&mut self) {
        self.cache.unpin(self.key);
    }
}

/// Writable handle to a resident page. Pins the page until dropped; the
/// entry is already classified `Dirty` or `New`, so plain writes need no
/// further bookkeeping.
pub struct PageMut<'a> {
    cache: &'a PageCache,
    id: PageIndex,
    key: PageIndex,
}

impl PageMut<'_> {
    /// The page id the caller asked for (diversion stays internal).
    pub fn id(&self) -> PageIndex {
        self.id
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) {
        self.cache.read_entry(self.key, offset, out)
    }

    pub fn read_byte(&self, offset: usize) -> u8 {
        let mut b = [0u8; 1];
        self.read(offset, &mut b);
        b[0]
    }

    /// Copy `data` into the page starting at `offset`.
    pub fn write(&mut self, offset: usize, data: &[u8]) {
        self.cache.write_entry(self.key, offset, data)
    }

    /// Overwrite the whole page with `byte`.
    pub fn fill(&mut self, byte: u8) {
        self.cache.with_entry_mut(self.key, |data| data.fill(byte));
    }

    /// Run `f` over the mutable page contents without copying. The cache
    /// lock is held for the duration, so `f` must not call back into the
    /// cache.
    pub fn with_data_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.cache.with_entry_mut(self.key, f)
    }
}

impl Drop for PageMut<'_> {
    fn drop(&mut self) {
        self.cache.unpin(self.key);
    }
}
