//! # packfs — Transactional Core of a Compound Single-File Filesystem
//!
//! packfs packs many logical pages — and eventually the files and
//! directories built on top of them — into one host file, with crash-atomic
//! transitions between committed states. This crate is the transactional
//! core: everything above it (B-tree index, free store, directories, file
//! handles) consumes pages through the interfaces here.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  consumers (index, free store, directories)   │
//! ├───────────────────────────────────────────────┤
//! │  PageCache     pin / classify / evict / divert│
//! ├──────────────┬────────────────────────────────┤
//! │ CommitHandler│  recovery      log page codec  │
//! ├──────────────┴────────────────────────────────┤
//! │  FileIo        one host file (mmap or memory) │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! All pages are 4096 bytes and addressed by a 32-bit [`storage::PageIndex`].
//! A transaction mutates pages only through the [`storage::PageCache`]; the
//! dirty page protocol keeps every committed original intact until a
//! [`storage::CommitHandler`] has shadow-copied it, logged the copy, and
//! fenced the overwrite with file flushes. A crash at any instant leaves the
//! file in exactly one committed state, which [`storage::recovery`] restores
//! on the next open.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use packfs::storage::{MmapFile, PageCache};
//!
//! let file = Arc::new(MmapFile::create("pack.bin")?);
//! let mut cache = PageCache::new(file);
//!
//! let mut page = cache.new_page()?;
//! page.write(0, b"hello");
//! drop(page);
//!
//! cache.commit()?;
//! ```
//!
//! ## Concurrency
//!
//! One writer per transaction, any number of readers, coordinated by the
//! [`storage::LockProtocol`]: readers hold two shared locks, the writer an
//! exclusive mutex, and commit upgrades the writer by draining the readers.
//! The cache itself serializes its state internally, so handles are cheap to
//! pass around within the writer.
//!
//! ## Module Overview
//!
//! - [`storage`]: the page cache, commit protocol, log codec, recovery, lock
//!   protocol and backing-file implementations
//! - [`memory`]: the bounded page buffer pool
//! - [`config`]: centralized constants

pub mod config;
pub mod memory;
pub mod storage;

pub use storage::{
    CommitHandler, FileIo, Interval, LockProtocol, MemFile, MmapFile, PageCache, PageClass,
    PageIndex, PageMut, PageRef, INVALID_PAGE, PAGE_SIZE,
};
