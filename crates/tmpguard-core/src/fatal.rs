//! Process-wide fatal-signal hook.
//!
//! One handler is installed, once, for every signal in the configured fatal
//! set (see [`crate::config`]). When such a signal arrives the handler
//! pops and runs the registered actions, most recent first, then restores
//! the default dispositions and re-raises the signal so the process still
//! terminates with the original status.
//!
//! Actions live in a fixed table of atomics: registering one allocates
//! nothing the handler has to free, and popping one is a single CAS.

use std::cell::RefCell;
use std::mem::MaybeUninit;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::config;
use crate::diag::{self, DiagRecord, Level};
use crate::error::{Error, Result};
use crate::sigset::{SavedMask, SignalSet};
use crate::sys;

/// Maximum number of actions [`at_fatal_signal`] accepts.
pub const MAX_ACTIONS: usize = 64;

/// Signature of a fatal-signal action. Runs inside the signal handler and
/// must be async-signal-safe.
pub type Action = fn(i32);

static ACTIONS: [AtomicUsize; MAX_ACTIONS] = [const { AtomicUsize::new(0) }; MAX_ACTIONS];
static ACTION_COUNT: AtomicUsize = AtomicUsize::new(0);
static ACTION_WRITER: Mutex<()> = Mutex::new(());

struct FatalState {
    /// Signals the handler is installed for. Never freed.
    signals: Vec<i32>,
    set: SignalSet,
    /// First installation failure, as (signal, errno).
    failure: Option<(i32, i32)>,
}

static STATE: OnceLock<FatalState> = OnceLock::new();

fn state() -> &'static FatalState {
    STATE.get_or_init(install_handlers)
}

fn install_handlers() -> FatalState {
    let mut signals = Vec::new();
    let mut failure = None;
    for sig in config::active().fatal_signal_list() {
        if sig == libc::SIGKILL || sig == libc::SIGSTOP {
            diag::emit(
                &DiagRecord::new(Level::Warn, "uncatchable_fatal_signal")
                    .with_message(format!("{} cannot be caught", config::signal_name(sig))),
            );
            continue;
        }
        match current_disposition(sig) {
            Ok(old) if old == libc::SIG_IGN => continue,
            Ok(_) => {}
            Err(errno) => {
                failure.get_or_insert((sig, errno));
                continue;
            }
        }
        match set_disposition(sig, handler_address(), libc::SA_NODEFER) {
            Ok(()) => signals.push(sig),
            Err(errno) => {
                failure.get_or_insert((sig, errno));
            }
        }
    }
    if let Some((sig, errno)) = failure {
        diag::emit(
            &DiagRecord::new(Level::Warn, "signal_install_failed")
                .with_errno(errno)
                .with_message(format!("no cleanup handler for {}", config::signal_name(sig))),
        );
    }
    let set = SignalSet::from_signals(&signals);
    FatalState {
        signals,
        set,
        failure,
    }
}

#[allow(unsafe_code)]
fn current_disposition(sig: i32) -> std::result::Result<libc::sighandler_t, i32> {
    let mut old = MaybeUninit::<libc::sigaction>::zeroed();
    // SAFETY: a null new-action only queries; old is a valid out pointer.
    let rc = unsafe { libc::sigaction(sig, std::ptr::null(), old.as_mut_ptr()) };
    if rc == -1 {
        return Err(sys::errno());
    }
    // SAFETY: sigaction succeeded and filled `old`.
    Ok(unsafe { old.assume_init() }.sa_sigaction)
}

/// Async-signal-safe.
#[allow(unsafe_code)]
fn set_disposition(sig: i32, handler: libc::sighandler_t, flags: i32) -> std::result::Result<(), i32> {
    // SAFETY: an all-zero sigaction is a valid starting value.
    let mut action: libc::sigaction = unsafe { MaybeUninit::zeroed().assume_init() };
    action.sa_sigaction = handler;
    action.sa_flags = flags;
    // SAFETY: action is fully initialized; old-action pointer may be null.
    let rc = unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(sig, &action, std::ptr::null_mut())
    };
    if rc == -1 { Err(sys::errno()) } else { Ok(()) }
}

fn handler_address() -> libc::sighandler_t {
    fatal_signal_handler as extern "C" fn(libc::c_int) as libc::sighandler_t
}

extern "C" fn fatal_signal_handler(sig: libc::c_int) {
    run_actions(sig);
    // Restore default dispositions so the re-raised signal terminates us.
    // `sig` itself is reset even while STATE is still being published.
    let _ = set_disposition(sig, libc::SIG_DFL, 0);
    if let Some(state) = STATE.get() {
        for &s in &state.signals {
            let _ = set_disposition(s, libc::SIG_DFL, 0);
        }
    }
    let _ = sys::raise(sig);
}

/// Pop and run actions, most recent first. Each action runs at most once
/// even if another fatal signal interrupts this loop.
#[allow(unsafe_code)]
fn run_actions(sig: i32) {
    loop {
        let n = ACTION_COUNT.load(Ordering::Acquire);
        if n == 0 {
            break;
        }
        if ACTION_COUNT
            .compare_exchange(n, n - 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            continue;
        }
        let raw = ACTIONS[n - 1].load(Ordering::Acquire);
        if raw != 0 {
            // SAFETY: non-zero slots only ever hold a `fn(i32)` stored by
            // `at_fatal_signal`.
            let action = unsafe { std::mem::transmute::<usize, Action>(raw) };
            action(sig);
        }
    }
}

/// Install the fatal-signal handler if that has not happened yet.
///
/// Idempotent. Returns the first installation failure, if any, on every
/// call; signals that did install keep their handler regardless.
pub fn ensure_initialized() -> Result<()> {
    match state().failure {
        None => Ok(()),
        Some((signal, errno)) => Err(Error::SignalInstall {
            signal,
            source: std::io::Error::from_raw_os_error(errno),
        }),
    }
}

/// Register `action` to run when a fatal signal terminates the process.
///
/// Actions registered later run first. `action` executes inside a signal
/// handler and must restrict itself to async-signal-safe operations.
pub fn at_fatal_signal(action: Action) -> Result<()> {
    let _ = ensure_initialized();
    let _writer = ACTION_WRITER.lock();
    let n = ACTION_COUNT.load(Ordering::Acquire);
    if n >= MAX_ACTIONS {
        return Err(Error::ActionTableFull {
            capacity: MAX_ACTIONS,
        });
    }
    ACTIONS[n].store(action as usize, Ordering::Release);
    ACTION_COUNT.store(n + 1, Ordering::Release);
    Ok(())
}

/// Signals the handler is installed for.
#[must_use]
pub fn fatal_signals() -> Vec<i32> {
    state().signals.clone()
}

/// The installed fatal signals as a set, for masking.
#[must_use]
pub fn fatal_signal_set() -> SignalSet {
    state().set
}

/// Number of actions currently registered.
#[must_use]
pub fn action_count() -> usize {
    ACTION_COUNT.load(Ordering::Acquire)
}

// -------------------------------------------------------------------------
// Counted blocking
// -------------------------------------------------------------------------

thread_local! {
    static BLOCKED: RefCell<(usize, Option<SavedMask>)> = const { RefCell::new((0, None)) };
}

/// Block the fatal signals on the calling thread. Nestable: signals stay
/// blocked until the matching number of [`unblock_fatal_signals`] calls.
pub fn block_fatal_signals() {
    let set = fatal_signal_set();
    BLOCKED.with_borrow_mut(|(depth, saved)| {
        if *depth == 0 {
            *saved = Some(set.block());
        }
        *depth += 1;
    });
}

/// Undo one [`block_fatal_signals`]. Unbalanced calls are ignored.
pub fn unblock_fatal_signals() {
    BLOCKED.with_borrow_mut(|(depth, saved)| {
        if *depth == 0 {
            return;
        }
        *depth -= 1;
        if *depth == 0 {
            // Dropping the saved mask restores the pre-block mask.
            drop(saved.take());
        }
    });
}

/// RAII form of [`block_fatal_signals`].
#[must_use = "signals are unblocked as soon as the guard is dropped"]
pub struct FatalSignalsBlocked {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl FatalSignalsBlocked {
    pub fn new() -> Self {
        block_fatal_signals();
        Self {
            _not_send: std::marker::PhantomData,
        }
    }
}

impl Default for FatalSignalsBlocked {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FatalSignalsBlocked {
    fn drop(&mut self) {
        unblock_fatal_signals();
    }
}

impl std::fmt::Debug for FatalSignalsBlocked {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FatalSignalsBlocked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sigset::current_mask;

    #[test]
    fn initialization_is_idempotent() {
        let first = ensure_initialized().is_ok();
        let second = ensure_initialized().is_ok();
        assert_eq!(first, second);
        assert_eq!(fatal_signals(), fatal_signals());
    }

    #[test]
    fn handler_is_installed_for_fatal_set() {
        let _ = ensure_initialized();
        let signals = fatal_signals();
        assert!(!signals.contains(&libc::SIGKILL));
        for &sig in &signals {
            assert!(fatal_signal_set().contains(sig));
            let disp = current_disposition(sig).unwrap();
            assert_eq!(disp, handler_address());
        }
    }

    #[test]
    #[allow(unsafe_code)]
    fn handler_terminates_for_signal_missing_from_published_set() {
        // The child never runs a registry pass over live test entries.
        let _g = crate::reclaim::TEST_LOCK.lock();
        let sig = libc::SIGUSR2;
        assert!(!fatal_signals().contains(&sig));
        // SAFETY: the child only makes async-signal-safe calls before _exit.
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            let _ = set_disposition(sig, handler_address(), libc::SA_NODEFER);
            let _ = sys::raise(sig);
            // SAFETY: _exit has no preconditions.
            unsafe { libc::_exit(0) };
        }
        let mut status = 0;
        // SAFETY: pid is our child and status is a valid out pointer.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        assert_eq!(rc, pid);
        assert!(libc::WIFSIGNALED(status), "child exited with status {status:#x}");
        assert_eq!(libc::WTERMSIG(status), sig);
    }

    #[test]
    fn nested_blocking_unblocks_on_outermost() {
        let set = fatal_signal_set();
        let Some(&sig) = fatal_signals().first() else {
            return;
        };
        assert!(set.contains(sig));
        assert!(!current_mask().contains(sig));
        block_fatal_signals();
        block_fatal_signals();
        assert!(current_mask().contains(sig));
        unblock_fatal_signals();
        assert!(current_mask().contains(sig));
        unblock_fatal_signals();
        assert!(!current_mask().contains(sig));
        // Extra unblock is a no-op.
        unblock_fatal_signals();
        assert!(!current_mask().contains(sig));
    }

    #[test]
    fn guard_blocks_for_its_scope() {
        let Some(&sig) = fatal_signals().first() else {
            return;
        };
        {
            let _blocked = FatalSignalsBlocked::new();
            assert!(current_mask().contains(sig));
        }
        assert!(!current_mask().contains(sig));
    }
}
