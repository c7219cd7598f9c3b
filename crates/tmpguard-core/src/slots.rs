//! Append-only slot table read by the fatal-signal handler.
//!
//! Each slot optionally owns one `Arc<T>` (stored as a raw pointer). The
//! handler reads the logical length, then the backing array, then each slot,
//! all with acquire loads. Growth never resizes in place: a new backing array
//! is filled and published with a release store, and the old one is retired
//! to the [`RetireBin`], because a handler on another thread may still be
//! indexing it.
//!
//! Writers (reserve, publish, vacate) serialize on a `parking_lot::Mutex`.
//! The count is only raised after a backing large enough for it has been
//! published, so `count <= backing.len()` holds for every reader that loads
//! the count before the backing.

use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::reclaim::{CleanupPass, RetireBin};

struct Backing<T> {
    slots: Box<[AtomicPtr<T>]>,
}

impl<T> Backing<T> {
    fn with_capacity(cap: usize) -> Box<Self> {
        let slots = (0..cap)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::new(Self { slots })
    }
}

/// Growable table of optional `Arc<T>` slots.
pub struct SlotTable<T> {
    backing: AtomicPtr<Backing<T>>,
    count: AtomicUsize,
    writer: Mutex<()>,
    _owns: PhantomData<Arc<T>>,
}

// SAFETY: slot contents are Arc<T>; all shared mutation is atomic or under
// the writer mutex.
unsafe impl<T: Send + Sync> Send for SlotTable<T> {}
unsafe impl<T: Send + Sync> Sync for SlotTable<T> {}

impl<T: Send + Sync + 'static> SlotTable<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            backing: AtomicPtr::new(Box::into_raw(Backing::with_capacity(0))),
            count: AtomicUsize::new(0),
            writer: Mutex::new(()),
            _owns: PhantomData,
        }
    }

    /// Lock the table and make sure a vacant slot exists.
    ///
    /// Reuses the lowest vacant index below the logical length, otherwise
    /// the next index past it, growing the backing if needed. The table
    /// stays locked until the reservation is published or dropped.
    pub fn reserve<'a>(&'a self, bin: &RetireBin) -> Reservation<'a, T> {
        let guard = self.writer.lock();
        let count = self.count.load(Ordering::Relaxed);
        let backing = self.backing_ref();
        let reuse = backing.slots[..count]
            .iter()
            .position(|s| s.load(Ordering::Relaxed).is_null());
        let index = match reuse {
            Some(i) => i,
            None => {
                if count == backing.slots.len() {
                    self.grow(count, bin);
                }
                count
            }
        };
        Reservation {
            table: self,
            index,
            _guard: guard,
        }
    }

    /// Copy-and-publish growth. Caller holds the writer lock.
    fn grow(&self, count: usize, bin: &RetireBin) {
        let old = self.backing.load(Ordering::Relaxed);
        // SAFETY: backing is never null and only replaced under the writer lock.
        let old_ref = unsafe { &*old };
        let new_cap = 2 * old_ref.slots.len() + 1;
        let fresh = Backing::with_capacity(new_cap);
        for (dst, src) in fresh.slots.iter().zip(old_ref.slots[..count].iter()) {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        self.backing.store(Box::into_raw(fresh), Ordering::Release);
        // SAFETY: old came from Box::into_raw and is no longer published.
        bin.retire(unsafe { Box::from_raw(old) });
    }

    /// Clear slot `index` if it still holds `expected`, retiring the Arc.
    ///
    /// Trailing vacant slots are trimmed from the logical length. Returns
    /// `false` if the slot holds something else.
    pub fn vacate(&self, index: usize, expected: &Arc<T>, bin: &RetireBin) -> bool {
        let _guard = self.writer.lock();
        let count = self.count.load(Ordering::Relaxed);
        if index >= count {
            return false;
        }
        let backing = self.backing_ref();
        let slot = &backing.slots[index];
        let current = slot.load(Ordering::Relaxed);
        if current.cast_const() != Arc::as_ptr(expected) {
            return false;
        }
        slot.store(ptr::null_mut(), Ordering::Release);
        if index + 1 == count {
            let mut new_count = index;
            while new_count > 0 && backing.slots[new_count - 1].load(Ordering::Relaxed).is_null()
            {
                new_count -= 1;
            }
            self.count.store(new_count, Ordering::Release);
        }
        // SAFETY: the slot owned one strong count created by Arc::into_raw.
        bin.retire(Box::new(unsafe { Arc::from_raw(current.cast_const()) }));
        true
    }

    /// Whether slot `index` currently holds exactly `expected`.
    pub fn holds(&self, index: usize, expected: &Arc<T>) -> bool {
        let _guard = self.writer.lock();
        index < self.count.load(Ordering::Relaxed)
            && ptr::eq(
                self.backing_ref().slots[index].load(Ordering::Relaxed),
                Arc::as_ptr(expected),
            )
    }

    /// Lock-free traversal of live slots for cleanup passes.
    /// Async-signal-safe.
    pub fn iter<'a>(&'a self, _pass: &'a CleanupPass) -> impl Iterator<Item = &'a T> + 'a {
        let count = self.count.load(Ordering::Acquire);
        // SAFETY: published backings are retired, never freed, while a pass exists.
        let backing: &'a Backing<T> = unsafe { &*self.backing.load(Ordering::Acquire) };
        let bound = count.min(backing.slots.len());
        backing.slots[..bound].iter().filter_map(|slot| {
            let p = slot.load(Ordering::Acquire);
            // SAFETY: occupied slots hold a strong Arc count; vacated Arcs are
            // retired and outlive the pass.
            (!p.is_null()).then(|| unsafe { &*p })
        })
    }

    /// Collect strong references to every live slot (mutator side).
    pub fn snapshot(&self) -> Vec<(usize, Arc<T>)> {
        let _guard = self.writer.lock();
        let count = self.count.load(Ordering::Relaxed);
        let backing = self.backing_ref();
        backing.slots[..count]
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                let p = slot.load(Ordering::Relaxed).cast_const();
                if p.is_null() {
                    return None;
                }
                // SAFETY: the slot's strong count keeps p alive while we hold
                // the writer lock; we add one more for the caller.
                unsafe { Arc::increment_strong_count(p) };
                Some((i, unsafe { Arc::from_raw(p) }))
            })
            .collect()
    }

    /// Logical length (highest used index + 1).
    #[must_use]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocated slots in the current backing.
    #[must_use]
    pub fn capacity(&self) -> usize {
        let _guard = self.writer.lock();
        self.backing_ref().slots.len()
    }

    fn backing_ref(&self) -> &Backing<T> {
        // SAFETY: backing is never null; callers on the writer side hold the
        // lock, so it cannot be retired underneath them.
        unsafe { &*self.backing.load(Ordering::Acquire) }
    }
}

impl<T: Send + Sync + 'static> Default for SlotTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for SlotTable<T> {
    fn drop(&mut self) {
        let backing = *self.backing.get_mut();
        // SAFETY: exclusive access; backing came from Box::into_raw.
        let backing = unsafe { Box::from_raw(backing) };
        for slot in backing.slots.iter() {
            let p = slot.load(Ordering::Relaxed);
            if !p.is_null() {
                // SAFETY: each occupied slot owns one strong count.
                drop(unsafe { Arc::from_raw(p.cast_const()) });
            }
        }
    }
}

/// A locked, reserved slot index. Publishing consumes it.
pub struct Reservation<'a, T: Send + Sync + 'static> {
    table: &'a SlotTable<T>,
    index: usize,
    _guard: MutexGuard<'a, ()>,
}

impl<T: Send + Sync + 'static> Reservation<'_, T> {
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Store `value` in the reserved slot and extend the logical length.
    ///
    /// The slot pointer is release-stored before the count, so a handler
    /// that sees the new count also sees a fully built value.
    pub fn publish(self, value: Arc<T>) -> usize {
        let backing = self.table.backing_ref();
        backing.slots[self.index].store(Arc::into_raw(value).cast_mut(), Ordering::Release);
        let count = self.table.count.load(Ordering::Relaxed);
        if self.index >= count {
            self.table.count.store(self.index + 1, Ordering::Release);
        }
        self.index
    }
}
