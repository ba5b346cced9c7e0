//! # packfs Configuration Constants
//!
//! All tunable values of the core in one place. The page geometry is fixed by
//! the on-file format; the cache sizing values are defaults that callers can
//! override per `PageCache`.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (4096 bytes, fixed by the on-file format)
//!       │
//!       ├─> LOG_PAGE_HEADER_SIZE (24 bytes)
//!       │
//!       └─> LOG_PAGE_MAX_PAIRS (derived: (PAGE_SIZE - header) / 8)
//!             Each pair is two little-endian u32 page indices.
//!
//! DEFAULT_MAX_CACHED_PAGES (256)
//!       │
//!       └─> trim_check() target is MAX * 3 / 4; the factor keeps eviction
//!           batches large enough that trims stay rare under steady load.
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `LOG_PAGE_HEADER_SIZE + LOG_PAGE_MAX_PAIRS * 8 == PAGE_SIZE` — a log
//!    page fills its page exactly, so serialization is bit-stable.
//! 2. `DEFAULT_MAX_CACHED_PAGES >= 4` — the trim target `MAX * 3 / 4` must
//!    stay below `MAX` or `trim_check` would never shrink the cache.

/// Size of every page in the backing file, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Default upper bound on resident cache entries before `trim_check` evicts.
///
/// Pinned pages are never evicted, so a workload holding more than this many
/// pins will exceed the bound until the pins are released.
pub const DEFAULT_MAX_CACHED_PAGES: usize = 256;

/// Bytes of fixed header at the start of a log page (magic, self id, pair
/// count, checksum).
pub const LOG_PAGE_HEADER_SIZE: usize = 24;

/// Number of `(original, copy)` pairs one log page can carry.
pub const LOG_PAGE_MAX_PAIRS: usize = (PAGE_SIZE - LOG_PAGE_HEADER_SIZE) / 8;

const _: () = assert!(
    LOG_PAGE_HEADER_SIZE + LOG_PAGE_MAX_PAIRS * 8 == PAGE_SIZE,
    "log page layout must fill the page exactly"
);

const _: () = assert!(
    DEFAULT_MAX_CACHED_PAGES >= 4,
    "trim target MAX * 3 / 4 must be strictly below MAX"
);
