//! Signal sets and per-thread signal masking.
//!
//! [`SignalSet`] is a plain copy of `sigset_t`. Blocking returns a
//! [`SavedMask`] which restores the previous mask when dropped; both
//! operations are async-signal-safe, so the spinlock can use them from
//! inside the fatal-signal handler.

use std::mem::MaybeUninit;

/// A set of signal numbers.
#[derive(Clone, Copy)]
pub struct SignalSet {
    raw: libc::sigset_t,
}

// SAFETY: sigset_t is plain data without interior pointers.
unsafe impl Send for SignalSet {}
unsafe impl Sync for SignalSet {}

impl SignalSet {
    /// The empty set.
    #[must_use]
    pub fn empty() -> Self {
        let mut raw = MaybeUninit::<libc::sigset_t>::uninit();
        // SAFETY: sigemptyset fully initializes the set.
        unsafe {
            libc::sigemptyset(raw.as_mut_ptr());
            Self {
                raw: raw.assume_init(),
            }
        }
    }

    /// Build a set from signal numbers; out-of-range numbers are skipped.
    #[must_use]
    pub fn from_signals(signals: &[i32]) -> Self {
        let mut set = Self::empty();
        for &sig in signals {
            set.add(sig);
        }
        set
    }

    /// Add `sig` to the set. Returns false if `sig` is not a valid signal.
    pub fn add(&mut self, sig: i32) -> bool {
        // SAFETY: raw is an initialized sigset_t.
        unsafe { libc::sigaddset(&mut self.raw, sig) == 0 }
    }

    /// Whether `sig` is a member.
    #[must_use]
    pub fn contains(&self, sig: i32) -> bool {
        // SAFETY: raw is an initialized sigset_t.
        unsafe { libc::sigismember(&self.raw, sig) == 1 }
    }

    /// Block every signal of this set on the calling thread.
    ///
    /// Async-signal-safe. The previous mask is restored when the returned
    /// guard is dropped.
    #[must_use = "the mask is restored as soon as the guard is dropped"]
    pub fn block(&self) -> SavedMask {
        let mut old = MaybeUninit::<libc::sigset_t>::uninit();
        // SAFETY: both pointers are valid; pthread_sigmask with SIG_BLOCK and
        // a valid set cannot fail.
        unsafe {
            libc::pthread_sigmask(libc::SIG_BLOCK, &self.raw, old.as_mut_ptr());
            SavedMask {
                old: old.assume_init(),
            }
        }
    }

    /// Remove this set from the calling thread's blocked mask.
    pub fn unblock(&self) {
        // SAFETY: raw is an initialized sigset_t; old-set pointer may be null.
        unsafe {
            libc::pthread_sigmask(libc::SIG_UNBLOCK, &self.raw, std::ptr::null_mut());
        }
    }

    /// Raw view for `sigaction`/`sigprocmask` callers.
    #[must_use]
    pub fn as_raw(&self) -> &libc::sigset_t {
        &self.raw
    }
}

impl std::fmt::Debug for SignalSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let members: Vec<i32> = (1..max_signal()).filter(|&s| self.contains(s)).collect();
        f.debug_tuple("SignalSet").field(&members).finish()
    }
}

/// Signal mask saved by [`SignalSet::block`].
pub struct SavedMask {
    old: libc::sigset_t,
}

impl Drop for SavedMask {
    fn drop(&mut self) {
        // SAFETY: old was filled by pthread_sigmask.
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.old, std::ptr::null_mut());
        }
    }
}

/// The mask currently in effect on the calling thread.
#[must_use]
pub fn current_mask() -> SignalSet {
    let mut cur = SignalSet::empty();
    // SAFETY: a null new-set only queries the mask.
    unsafe {
        libc::pthread_sigmask(libc::SIG_BLOCK, std::ptr::null(), &mut cur.raw);
    }
    cur
}

/// Exclusive upper bound of signal numbers probed by [`SignalSet`]'s `Debug`.
fn max_signal() -> i32 {
    #[cfg(target_os = "linux")]
    {
        libc::SIGRTMAX() + 1
    }
    #[cfg(not(target_os = "linux"))]
    {
        32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_contains() {
        let set = SignalSet::from_signals(&[libc::SIGINT, libc::SIGTERM]);
        assert!(set.contains(libc::SIGINT));
        assert!(set.contains(libc::SIGTERM));
        assert!(!set.contains(libc::SIGHUP));
    }

    #[test]
    fn invalid_signal_is_rejected() {
        let mut set = SignalSet::empty();
        assert!(!set.add(0));
        assert!(!set.add(100_000));
    }

    #[test]
    fn block_restores_previous_mask_on_drop() {
        let set = SignalSet::from_signals(&[libc::SIGUSR2]);
        assert!(!current_mask().contains(libc::SIGUSR2));
        {
            let _saved = set.block();
            assert!(current_mask().contains(libc::SIGUSR2));
        }
        assert!(!current_mask().contains(libc::SIGUSR2));
    }

    #[test]
    fn debug_lists_members() {
        let set = SignalSet::from_signals(&[libc::SIGHUP]);
        assert_eq!(format!("{set:?}"), format!("SignalSet([{}])", libc::SIGHUP));
    }
}
