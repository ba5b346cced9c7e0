//! # Lock Protocol
//!
//! Coordinates concurrent access to one backing file: many readers, one
//! writer, and an exclusive committer that drains the readers.
//!
//! ## The Three Primitives
//!
//! ```text
//! signal S   RwLock   readers hold shared; commit takes it exclusive first,
//!                     so no new reader can start queueing behind the commit
//! shared X   RwLock   readers hold shared; commit takes it exclusive second,
//!                     which drains every reader already inside
//! writer W   Mutex    the single transaction writer
//! ```
//!
//! Acquisition order is S before X everywhere, so there is no lock-order
//! inversion between readers and the committer. The writer never touches S or
//! X until it upgrades to commit access, which is why readers and the writer
//! run concurrently for the whole transaction body.
//!
//! ## Upgrade
//!
//! [`LockProtocol::commit_access`] consumes a held [`WriteLock`] and returns a
//! [`CommitLock`] holding all three primitives. Once it returns, no reader is
//! observing any page the commit is about to overwrite. The `try_` variant
//! hands the original write lock back on contention so no privilege is ever
//! dropped on a failed upgrade.

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The lock state shared by all accessors of one backing file.
#[derive(Default)]
pub struct LockProtocol {
    signal: RwLock<()>,
    shared: RwLock<()>,
    writer: Mutex<()>,
}

/// Shared access token: holds the signal and shared locks until dropped.
pub struct ReadLock<'a> {
    _signal: RwLockReadGuard<'a, ()>,
    _shared: RwLockReadGuard<'a, ()>,
}

/// Exclusive-writer token. Readers are unaffected; only other writers block.
pub struct WriteLock<'a> {
    _writer: MutexGuard<'a, ()>,
    protocol: &'a LockProtocol,
}

/// Exclusive-committer token: writer plus both shared primitives held
/// exclusively. While this exists no reader can start or be in flight.
pub struct CommitLock<'a> {
    _shared: RwLockWriteGuard<'a, ()>,
    _signal: RwLockWriteGuard<'a, ()>,
    write: WriteLock<'a>,
}

/// A lock token of either polarity, as handed out by
/// [`FileIo::default_access`](super::FileIo::default_access).
pub enum Access<'a> {
    Read(ReadLock<'a>),
    Write(WriteLock<'a>),
}

impl LockProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until shared access is granted.
    pub fn read_access(&self) -> ReadLock<'_> {
        let signal = self.signal.read();
        let shared = self.shared.read();
        ReadLock {
            _signal: signal,
            _shared: shared,
        }
    }

    /// Shared access without blocking; `None` on contention.
    pub fn try_read_access(&self) -> Option<ReadLock<'_>> {
        let signal = self.signal.try_read()?;
        let shared = self.shared.try_read()?;
        Some(ReadLock {
            _signal: signal,
            _shared: shared,
        })
    }

    /// Block until exclusive-writer access is granted.
    pub fn write_access(&self) -> WriteLock<'_> {
        WriteLock {
            _writer: self.writer.lock(),
            protocol: self,
        }
    }

    /// Exclusive-writer access without blocking; `None` on contention.
    pub fn try_write_access(&self) -> Option<WriteLock<'_>> {
        Some(WriteLock {
            _writer: self.writer.try_lock()?,
            protocol: self,
        })
    }

    /// Upgrade a held write lock to commit access, draining all readers.
    ///
    /// Panics if `write` was issued by a different `LockProtocol` instance —
    /// that is protocol misuse, not a runtime condition.
    pub fn commit_access<'a>(&'a self, write: WriteLock<'a>) -> CommitLock<'a> {
        assert!(
            std::ptr::eq(self, write.protocol),
            "write lock belongs to a different lock protocol instance"
        );

        let signal = self.signal.write();
        let shared = self.shared.write();
        CommitLock {
            _shared: shared,
            _signal: signal,
            write,
        }
    }

    /// Non-blocking upgrade; returns the untouched write lock on contention.
    pub fn try_commit_access<'a>(
        &'a self,
        write: WriteLock<'a>,
    ) -> Result<CommitLock<'a>, WriteLock<'a>> {
        assert!(
            std::ptr::eq(self, write.protocol),
            "write lock belongs to a different lock protocol instance"
        );

        let Some(signal) = self.signal.try_write() else {
            return Err(write);
        };
        let Some(shared) = self.shared.try_write() else {
            return Err(write);
        };
        Ok(CommitLock {
            _shared: shared,
            _signal: signal,
            write,
        })
    }
}

impl<'a> CommitLock<'a> {
    /// Release the exclusive fences but keep the writer privilege.
    pub fn into_write_lock(self) -> WriteLock<'a> {
        self.write
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn readers_coexist() {
        let protocol = LockProtocol::new();
        let r1 = protocol.read_access();
        let r2 = protocol.try_read_access();
        assert!(r2.is_some());
        drop(r1);
    }

    #[test]
    fn writer_excludes_writer_only() {
        let protocol = LockProtocol::new();
        let w = protocol.write_access();
        assert!(protocol.try_write_access().is_none());
        assert!(protocol.try_read_access().is_some());
        drop(w);
        assert!(protocol.try_write_access().is_some());
    }

    #[test]
    fn commit_access_blocks_new_readers() {
        let protocol = LockProtocol::new();
        let w = protocol.write_access();
        let commit = protocol.commit_access(w);

        assert!(protocol.try_read_access().is_none());

        let w = commit.into_write_lock();
        assert!(protocol.try_read_access().is_some());
        drop(w);
    }

    #[test]
    fn try_commit_returns_write_lock_on_contention() {
        let protocol = LockProtocol::new();
        let reader = protocol.read_access();
        let w = protocol.write_access();

        let w = match protocol.try_commit_access(w) {
            Ok(_) => panic!("commit access granted while a reader is active"),
            Err(w) => w,
        };

        // the returned lock still excludes other writers
        assert!(protocol.try_write_access().is_none());

        drop(reader);
        assert!(protocol.try_commit_access(w).is_ok());
    }

    #[test]
    fn commit_access_drains_active_readers() {
        let protocol = Arc::new(LockProtocol::new());
        let committed = Arc::new(AtomicBool::new(false));

        let reader = protocol.read_access();

        let t = thread::spawn({
            let protocol = Arc::clone(&protocol);
            let committed = Arc::clone(&committed);
            move || {
                let w = protocol.write_access();
                let _commit = protocol.commit_access(w);
                committed.store(true, Ordering::SeqCst);
            }
        });

        thread::sleep(Duration::from_millis(50));
        assert!(
            !committed.load(Ordering::SeqCst),
            "commit must wait for the reader to drain"
        );

        drop(reader);
        t.join().unwrap();
        assert!(committed.load(Ordering::SeqCst));
    }

    #[test]
    #[should_panic(expected = "different lock protocol")]
    fn foreign_write_lock_is_rejected() {
        let a = LockProtocol::new();
        let b = LockProtocol::new();
        let w = b.write_access();
        let _ = a.commit_access(w);
    }
}
