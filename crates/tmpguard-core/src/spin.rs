//! Spinlock usable from inside a signal handler.
//!
//! OS mutexes are not async-signal-safe, so descriptor records are guarded
//! by a single atomic flag. Before spinning, the caller's fatal signals are
//! blocked: a fatal signal landing on the lock-holding thread therefore
//! cannot run the handler until the lock is released, and a handler on
//! another thread waits at most one `close()`.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::sigset::{SavedMask, SignalSet};

/// Atomic-flag lock whose acquisition blocks a signal set first.
#[derive(Debug, Default)]
pub struct SigSpinLock {
    locked: AtomicBool,
}

impl SigSpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Block `mask`, then spin until the lock is ours.
    ///
    /// Never fails and never sleeps in the kernel. The returned guard
    /// releases the flag and then restores the previous signal mask.
    pub fn lock(&self, mask: &SignalSet) -> SpinGuard<'_> {
        let saved = mask.block();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        SpinGuard {
            lock: self,
            _saved: saved,
        }
    }

    /// Whether some thread currently holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

/// Held [`SigSpinLock`]. Field order matters: the flag is cleared in
/// `drop` before `_saved` restores the mask.
pub struct SpinGuard<'a> {
    lock: &'a SigSpinLock,
    _saved: SavedMask,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
