//! # Crash Recovery
//!
//! On open, a file either carries the log pages of an interrupted commit or
//! it does not. No logs means the last commit either finished completely
//! (its own truncation retired the logs) or never reached the point of
//! overwriting committed pages — in both cases the committed image is intact
//! and there is nothing to do.
//!
//! When logs are present, the interrupted commit may have partially
//! overwritten its dirty originals. Every log pair points from an original
//! to a shadow copy holding that original's committed contents, so replaying
//! `copy → original` restores the pre-commit image exactly. The shadow area
//! and the logs above it are then truncated away, which also re-arms the
//! next open: without the truncation the same rollback would replay forever.

use eyre::Result;
use tracing::debug;

use super::log::read_log_pairs;
use super::{copy_page, FileIo};

/// Restore the last committed state of `file`; returns the number of pages
/// that had to be rolled back (0 for a clean file).
///
/// Runs before any cache traffic — [`PageCache::open`](super::PageCache::open)
/// calls this on every file it does not create fresh.
pub fn recover(file: &dyn FileIo) -> Result<usize> {
    let pairs = read_log_pairs(file)?;
    if pairs.is_empty() {
        return Ok(0);
    }

    for &(original, copy) in &pairs {
        copy_page(file, copy, original)?;
    }
    // restored originals must be durable before the shadows disappear
    file.flush()?;

    let shadow_base = pairs
        .iter()
        .map(|&(_, copy)| copy)
        .min()
        .expect("pairs is non-empty");
    file.truncate(shadow_base as usize)?;
    file.flush()?;

    debug!(
        restored = pairs.len(),
        truncated_to = shadow_base,
        "recovery.rolled_back_interrupted_commit"
    );
    Ok(pairs.len())
}
