//! Cooperative async reader/writer gate
//!
//! Many readers or one writer. Used by the access layer to serialize
//! writers against single-file SQLite databases.
//!
//! The gate is a fair (FIFO) async mutex. Readers hold it only long enough
//! to register themselves in the reader count; writers hold it for their
//! whole critical section, including the wait for registered readers to
//! drain. A reader that arrives while a writer is queued or active therefore
//! waits behind that writer, which keeps writers from starving.
//!
//! Not reentrant: taking a second guard of either kind while holding one
//! can deadlock if a writer is waiting.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, OwnedMutexGuard};
use tracing::trace;

/// Async reader/writer lock with writer priority over newly arriving readers
#[derive(Clone)]
pub struct AsyncRwLock {
    inner: Arc<Inner>,
}

struct Inner {
    gate: Arc<tokio::sync::Mutex<()>>,
    readers: Mutex<usize>,
    drained: Notify,
}

impl Inner {
    fn readers(&self) -> MutexGuard<'_, usize> {
        self.readers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for AsyncRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncRwLock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                gate: Arc::new(tokio::sync::Mutex::new(())),
                readers: Mutex::new(0),
                drained: Notify::new(),
            }),
        }
    }

    /// Register as a reader
    ///
    /// Waits only while a writer holds or is queued for the gate.
    pub async fn read(&self) -> ReadGuard {
        let _gate = self.inner.gate.lock().await;
        let mut readers = self.inner.readers();
        *readers += 1;
        trace!(readers = *readers, "read lock acquired");

        ReadGuard {
            inner: self.inner.clone(),
        }
    }

    /// Take the exclusive lock
    ///
    /// Holds the gate while waiting for active readers to release.
    pub async fn write(&self) -> WriteGuard {
        let gate = self.inner.gate.clone().lock_owned().await;

        loop {
            let drained = self.inner.drained.notified();
            if *self.inner.readers() == 0 {
                break;
            }
            drained.await;
        }
        trace!("write lock acquired");

        WriteGuard { _gate: gate }
    }

    /// Number of registered readers
    pub fn readers(&self) -> usize {
        *self.inner.readers()
    }
}

/// Shared access; released on drop
#[must_use = "the read lock is released as soon as the guard is dropped"]
pub struct ReadGuard {
    inner: Arc<Inner>,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        let mut readers = self.inner.readers();
        *readers = readers.saturating_sub(1);
        if *readers == 0 {
            self.inner.drained.notify_one();
        }
    }
}

/// Exclusive access; released on drop
#[must_use = "the write lock is released as soon as the guard is dropped"]
pub struct WriteGuard {
    _gate: OwnedMutexGuard<()>,
}

impl fmt::Debug for ReadGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadGuard").finish_non_exhaustive()
    }
}

impl fmt::Debug for WriteGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteGuard").finish_non_exhaustive()
    }
}
