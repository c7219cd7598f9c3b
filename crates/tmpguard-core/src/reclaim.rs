//! Deferred reclamation for memory the signal handler may be reading.
//!
//! Quiescence here is simpler than full QSBR: the only reader that walks
//! registry structures without a lock is a cleanup pass (the fatal-signal
//! handler or [`crate::run_cleanup_now`]). Each pass holds a
//! [`CleanupPass`] token for its whole traversal, and unlinked objects wait
//! in a [`RetireBin`] until no pass is in progress.
//!
//! # Ordering
//!
//! Mutator: unlink (release store) → `SeqCst` fence → read pass counter.
//! Pass: increment counter → `SeqCst` fence → load list heads.
//!
//! The two fences guarantee that either the mutator observes the pass and
//! keeps the garbage, or the pass starts after the unlink and can never
//! reach the retired object.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering, fence};

use parking_lot::Mutex;

/// Number of cleanup passes currently traversing registry structures.
static PASSES_IN_PROGRESS: AtomicUsize = AtomicUsize::new(0);

/// Token proving a cleanup pass is in progress.
///
/// Lock-free iterators require a `&CleanupPass`, so references they yield
/// cannot outlive the token. Entering and dropping a pass are both
/// async-signal-safe.
#[derive(Debug)]
pub struct CleanupPass {
    _private: (),
}

impl CleanupPass {
    /// Begin a pass. Async-signal-safe: one atomic RMW and one fence.
    pub fn enter() -> Self {
        PASSES_IN_PROGRESS.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        Self { _private: () }
    }
}

impl Drop for CleanupPass {
    fn drop(&mut self) {
        PASSES_IN_PROGRESS.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Whether any cleanup pass is running right now.
#[must_use]
pub fn cleanup_in_progress() -> bool {
    PASSES_IN_PROGRESS.load(Ordering::SeqCst) != 0
}

/// Objects unlinked from signal-visible structures, awaiting quiescence.
#[derive(Default)]
pub struct RetireBin {
    garbage: Mutex<Vec<Box<dyn Any + Send>>>,
}

impl RetireBin {
    pub const fn new() -> Self {
        Self {
            garbage: Mutex::new(Vec::new()),
        }
    }

    /// Park `object` until the next quiescence point.
    ///
    /// Must only be called outside signal context, after `object` has been
    /// made unreachable from every signal-visible root.
    pub fn retire<T: Any + Send>(&self, object: Box<T>) {
        self.garbage.lock().push(object);
    }

    /// Free everything retired so far if no cleanup pass is in progress.
    ///
    /// Returns the number of objects freed. The check happens under the bin
    /// lock so an object retired concurrently was unlinked before our fence.
    pub fn collect(&self) -> usize {
        let drained = {
            let mut garbage = self.garbage.lock();
            fence(Ordering::SeqCst);
            if cleanup_in_progress() {
                return 0;
            }
            std::mem::take(&mut *garbage)
        };
        let freed = drained.len();
        drop(drained);
        freed
    }

    /// Objects currently awaiting reclamation.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.garbage.lock().len()
    }
}

impl std::fmt::Debug for RetireBin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetireBin")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
pub(crate) static TEST_LOCK: Mutex<()> = Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct DropFlag(Arc<AtomicUsize>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn collect_frees_when_quiescent() {
        let _g = TEST_LOCK.lock();
        let drops = Arc::new(AtomicUsize::new(0));
        let bin = RetireBin::new();
        bin.retire(Box::new(DropFlag(Arc::clone(&drops))));
        bin.retire(Box::new(DropFlag(Arc::clone(&drops))));
        assert_eq!(bin.pending(), 2);
        assert_eq!(bin.collect(), 2);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        assert_eq!(bin.pending(), 0);
    }

    #[test]
    fn collect_defers_while_pass_in_progress() {
        let _g = TEST_LOCK.lock();
        let drops = Arc::new(AtomicUsize::new(0));
        let bin = RetireBin::new();
        bin.retire(Box::new(DropFlag(Arc::clone(&drops))));
        {
            let _pass = CleanupPass::enter();
            assert!(cleanup_in_progress());
            assert_eq!(bin.collect(), 0);
            assert_eq!(drops.load(Ordering::SeqCst), 0);
        }
        assert!(!cleanup_in_progress());
        assert_eq!(bin.collect(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
