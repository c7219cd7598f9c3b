//! Keyed linked list that a signal handler can walk while other threads
//! mutate it.
//!
//! # Design
//!
//! - Nodes are heap-allocated once, by mutators, outside signal context.
//! - The `next` chain is the only structure the handler reads. It is kept
//!   consistent at every instruction: a node is fully initialized before a
//!   release store links it in, and unlinking is a single release store of
//!   the predecessor's `next` (or `head`).
//! - Unlinked nodes keep their own `next` pointer, so a handler standing on
//!   one can still reach the rest of the list.
//! - Unlinked nodes are handed to a [`RetireBin`], never freed in place.
//! - A `HashMap` index under a `parking_lot::Mutex` gives mutators O(1)
//!   lookup by key, and `prev` back-links (touched only under that mutex)
//!   give O(1) removal. Traversal never allocates.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::reclaim::{CleanupPass, RetireBin};

struct Node<T> {
    value: T,
    /// Signal-visible forward link.
    next: AtomicPtr<Node<T>>,
    /// Mutator-only back link (null for the head node).
    prev: AtomicPtr<Node<T>>,
}

/// Owned pointer to a linked node, stored in the index.
struct NodePtr<T>(NonNull<Node<T>>);

// SAFETY: the pointee is only mutated under the index mutex and is itself
// Send + Sync when T is.
unsafe impl<T: Send + Sync> Send for NodePtr<T> {}

/// Signal-safe list of `T`, deduplicated by key `K`.
pub struct SignalSafeList<K, T> {
    head: AtomicPtr<Node<T>>,
    len: AtomicUsize,
    index: Mutex<HashMap<K, NodePtr<T>>>,
}

// SAFETY: all shared mutation goes through atomics or the index mutex.
unsafe impl<K: Send, T: Send + Sync> Send for SignalSafeList<K, T> {}
unsafe impl<K: Send, T: Send + Sync> Sync for SignalSafeList<K, T> {}

impl<K, T> SignalSafeList<K, T>
where
    K: Eq + Hash,
    T: Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
            index: Mutex::new(HashMap::new()),
        }
    }

    /// Insert `value` at the front unless `key` is already present.
    ///
    /// Returns `true` if the value was inserted.
    pub fn insert_front(&self, key: K, value: T) -> bool {
        let mut index = self.index.lock();
        if index.contains_key(&key) {
            return false;
        }
        let old_head = self.head.load(Ordering::Relaxed);
        let node = Box::into_raw(Box::new(Node {
            value,
            next: AtomicPtr::new(old_head),
            prev: AtomicPtr::new(ptr::null_mut()),
        }));
        if !old_head.is_null() {
            // SAFETY: old_head is linked and only freed after removal under this lock.
            unsafe { (*old_head).prev.store(node, Ordering::Relaxed) };
        }
        // Publish only after the node is fully initialized.
        self.head.store(node, Ordering::Release);
        self.len.fetch_add(1, Ordering::Release);
        // SAFETY: Box::into_raw never returns null.
        index.insert(key, NodePtr(unsafe { NonNull::new_unchecked(node) }));
        true
    }

    /// Unlink the entry for `key`, handing its node to `bin`.
    ///
    /// Returns `true` if the key was present.
    pub fn remove<Q>(&self, key: &Q, bin: &RetireBin) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut index = self.index.lock();
        match index.remove(key) {
            Some(node) => {
                // SAFETY: the node came out of our index, so it is linked.
                let boxed = unsafe { self.unlink(node) };
                bin.retire(boxed);
                true
            }
            None => false,
        }
    }

    /// Unlink every entry for which `pred` returns `true`.
    ///
    /// Returns the number of entries removed.
    pub fn remove_where(&self, mut pred: impl FnMut(&K, &T) -> bool, bin: &RetireBin) -> usize {
        let mut index = self.index.lock();
        let mut doomed: Vec<NonNull<Node<T>>> = Vec::new();
        index.retain(|k, n| {
            // SAFETY: indexed nodes are linked and alive while we hold the lock.
            if pred(k, unsafe { &n.0.as_ref().value }) {
                doomed.push(n.0);
                false
            } else {
                true
            }
        });
        for node in &doomed {
            // SAFETY: node was in our index until the retain above.
            let boxed = unsafe { self.unlink(NodePtr(*node)) };
            bin.retire(boxed);
        }
        doomed.len()
    }

    /// Whether `key` is present.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.lock().contains_key(key)
    }

    /// Look up `key` and map its value while the list is locked.
    pub fn find<Q, R>(&self, key: &Q, f: impl FnOnce(&T) -> R) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let index = self.index.lock();
        // SAFETY: indexed nodes are alive while we hold the lock.
        index.get(key).map(|n| f(unsafe { &n.0.as_ref().value }))
    }

    /// Visit every value under the mutator lock, front to back.
    pub fn for_each_locked(&self, mut f: impl FnMut(&T)) {
        let _index = self.index.lock();
        let mut cur = self.head.load(Ordering::Acquire);
        while let Some(node) = NonNull::new(cur) {
            // SAFETY: linked nodes cannot be unlinked while we hold the lock.
            let node = unsafe { node.as_ref() };
            f(&node.value);
            cur = node.next.load(Ordering::Acquire);
        }
    }

    /// Lock-free traversal for cleanup passes. Async-signal-safe.
    ///
    /// Entries removed concurrently may or may not be yielded; entries
    /// inserted concurrently may or may not be yielded. Every yielded
    /// reference stays valid for the lifetime of `pass`.
    pub fn iter<'a>(&'a self, _pass: &'a CleanupPass) -> Iter<'a, T> {
        Iter {
            cur: self.head.load(Ordering::Acquire),
            _marker: PhantomData,
        }
    }

    /// Number of linked entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unlink `node` from the signal-visible chain and return ownership.
    ///
    /// # Safety
    ///
    /// The caller holds the index lock and `node` is currently linked.
    unsafe fn unlink(&self, node: NodePtr<T>) -> Box<Node<T>> {
        let raw = node.0.as_ptr();
        // SAFETY: per contract, raw is a live linked node.
        let (prev, next) = unsafe {
            (
                (*raw).prev.load(Ordering::Relaxed),
                (*raw).next.load(Ordering::Relaxed),
            )
        };
        // One release store detaches the node from the forward chain. The
        // node's own `next` is left intact for any handler standing on it.
        if prev.is_null() {
            self.head.store(next, Ordering::Release);
        } else {
            // SAFETY: prev is linked (we hold the lock).
            unsafe { (*prev).next.store(next, Ordering::Release) };
        }
        if !next.is_null() {
            // SAFETY: next is linked (we hold the lock).
            unsafe { (*next).prev.store(prev, Ordering::Relaxed) };
        }
        self.len.fetch_sub(1, Ordering::Release);
        // SAFETY: the node was created by Box::into_raw in insert_front and is
        // now unreachable from head.
        unsafe { Box::from_raw(raw) }
    }
}

impl<K: Eq + Hash, T: Send + Sync + 'static> Default for SignalSafeList<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> Drop for SignalSafeList<K, T> {
    fn drop(&mut self) {
        // Exclusive access: no pass can observe a list that is being dropped,
        // because owners retire lists through a RetireBin first.
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            // SAFETY: every linked node came from Box::into_raw.
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next.load(Ordering::Relaxed);
        }
    }
}

impl<K, T> std::fmt::Debug for SignalSafeList<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalSafeList")
            .field("len", &self.len.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Lock-free iterator returned by [`SignalSafeList::iter`].
pub struct Iter<'a, T> {
    cur: *mut Node<T>,
    _marker: PhantomData<&'a T>,
}

impl<'a, T: 'a> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let node = NonNull::new(self.cur)?;
        // SAFETY: nodes reachable from head are freed only after retirement,
        // and retired objects are not freed while a CleanupPass exists.
        let node = unsafe { &*node.as_ptr() };
        self.cur = node.next.load(Ordering::Acquire);
        Some(&node.value)
    }
}
