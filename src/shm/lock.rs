/// Per-chain sequence lock.
///
/// Each `HashSlot` carries a `(lock, serial)` pair: `lock` excludes
/// concurrent writers via CAS, `serial` is bumped by the lock holder on
/// every successful unlock. Readers never touch `lock`; they snapshot
/// `serial` before traversing a chain and use it only to decide, on a
/// failed speculative allocation, whether to give a concurrent insert one
/// more pass (see `Map::get`). This is not a reader-retry sequence lock in
/// the classic sense — readers are permitted to return a stale-but-valid
/// traversal rather than loop on a torn read.
use std::sync::atomic::{AtomicI32, Ordering};

use super::layout::HashSlot;

/// Borrowed view of one `HashSlot`'s lock/serial pair.
pub struct ChainLock<'a> {
    lock: &'a AtomicI32,
    serial: &'a AtomicI32,
}

impl<'a> ChainLock<'a> {
    pub fn new(slot: &'a HashSlot) -> Self {
        ChainLock {
            lock: &slot.lock,
            serial: &slot.serial,
        }
    }

    /// Snapshot the current serial. Callers read this before traversing
    /// the chain so a later failed `lock` attempt can detect whether
    /// anyone else mutated the chain in the meantime.
    pub fn serial(&self) -> i32 {
        self.serial.load(Ordering::Acquire)
    }

    /// Attempt to acquire the write lock, requiring the chain's serial to
    /// still equal `expected_serial`. Returns `true` on success; on
    /// failure (either the CAS lost, or the serial moved under us) no
    /// lock is held and the caller should retry its top-level operation.
    pub fn try_lock(&self, expected_serial: i32) -> bool {
        if self
            .lock
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        if self.serial.load(Ordering::Acquire) != expected_serial {
            self.lock.store(0, Ordering::Release);
            return false;
        }
        true
    }

    /// Release the write lock. Increments `serial` before clearing the
    /// flag so a writer that next acquires the lock observes the bumped
    /// serial no later than it observes `lock == 0`.
    pub fn unlock(&self) {
        self.serial.fetch_add(1, Ordering::Release);
        self.lock.store(0, Ordering::Release);
    }
}
