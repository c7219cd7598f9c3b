//! The process-wide registry and its cleanup pass.
//!
//! One [`Registry`] exists per process, created on first use. Creating it
//! installs the fatal-signal handler and registers the cleanup action, so
//! by the time anything is registered the handler is already in place.

use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStringExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::descriptors::{self, FdRecord};
use crate::diag::{self, DiagRecord};
use crate::dirs::DirRecord;
use crate::error::{Error, Result};
use crate::fatal;
use crate::list::SignalSafeList;
use crate::reclaim::{CleanupPass, RetireBin};
use crate::sigset::SignalSet;
use crate::slots::SlotTable;
use crate::sys;

/// Temporary files, directories and descriptors the process must not leak.
pub struct Registry {
    /// Files that belong to no temporary directory.
    pub(crate) files: SignalSafeList<CString, CString>,
    /// Descriptors keyed by a record id; fd numbers get reused by the OS.
    pub(crate) descriptors: SignalSafeList<u64, Arc<FdRecord>>,
    pub(crate) dirs: SlotTable<DirRecord>,
    pub(crate) bin: RetireBin,
    /// Fatal signal set, blocked while a descriptor spinlock is held.
    pub(crate) mask: SignalSet,
    next_fd_id: AtomicU64,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

impl Registry {
    /// The process-wide registry, initializing it on first use.
    pub fn global() -> &'static Registry {
        REGISTRY.get_or_init(Self::init)
    }

    fn init() -> Self {
        // Installation failures were already reported by the fatal module;
        // explicit cleanup still works without a handler.
        let _ = fatal::ensure_initialized();
        if let Err(err) = fatal::at_fatal_signal(cleanup_action) {
            diag::emit(&DiagRecord::from_error(&err));
        }
        Self {
            files: SignalSafeList::new(),
            descriptors: SignalSafeList::new(),
            dirs: SlotTable::new(),
            bin: RetireBin::new(),
            mask: fatal::fatal_signal_set(),
            next_fd_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_fd_id(&self) -> u64 {
        self.next_fd_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Free retired objects if no cleanup pass is running.
    pub(crate) fn reclaim(&self) -> usize {
        self.bin.collect()
    }

    /// Close every open descriptor, remove every flat temp file, then
    /// every directory's files, subdirectories and the directory itself.
    ///
    /// Async-signal-safe: no allocation, no locks other than descriptor
    /// spinlocks, every error ignored.
    pub(crate) fn cleanup_pass(&self) {
        let pass = CleanupPass::enter();
        for record in self.descriptors.iter(&pass) {
            record.close_from_handler(&self.mask);
        }
        for path in self.files.iter(&pass) {
            let _ = sys::unlink(path);
        }
        for dir in self.dirs.iter(&pass) {
            dir.remove_tree(&pass);
        }
    }

    /// Counters describing the current registry contents.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut open_descriptors = 0;
        self.descriptors.for_each_locked(|record| {
            if !record.is_closed() {
                open_descriptors += 1;
            }
        });
        RegistryStats {
            files: self.files.len(),
            descriptors: self.descriptors.len(),
            open_descriptors,
            dirs: self.dirs.snapshot().len(),
            dir_slots: self.dirs.len(),
            retired: self.bin.pending(),
            os_closes: descriptors::os_close_count(),
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("files", &self.files.len())
            .field("descriptors", &self.descriptors.len())
            .field("dir_slots", &self.dirs.len())
            .field("bin", &self.bin)
            .finish()
    }
}

/// Snapshot returned by [`Registry::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    /// Registered flat temp files.
    pub files: usize,
    /// Descriptor records not yet swept.
    pub descriptors: usize,
    /// Descriptor records whose fd is still open.
    pub open_descriptors: usize,
    /// Live temporary directories.
    pub dirs: usize,
    /// Logical length of the directory slot table.
    pub dir_slots: usize,
    /// Objects waiting in the retire bin.
    pub retired: usize,
    /// `close()` calls issued on registered descriptors since startup.
    pub os_closes: u64,
}

fn cleanup_action(_sig: i32) {
    if let Some(registry) = REGISTRY.get() {
        registry.cleanup_pass();
    }
}

/// Run the fatal-signal cleanup right now, without a signal.
///
/// Everything registered is removed or closed, but stays registered:
/// later explicit cleanup calls see `ENOENT` or an already-closed
/// descriptor and succeed.
pub fn run_cleanup_now() {
    if let Some(registry) = REGISTRY.get() {
        registry.cleanup_pass();
        registry.reclaim();
    }
}

// -------------------------------------------------------------------------
// Path helpers
// -------------------------------------------------------------------------

/// Absolute, NUL-terminated form of `path`, as stored in the registry.
pub(crate) fn c_path(path: &Path) -> Result<CString> {
    let absolute = std::path::absolute(path).map_err(|_| Error::InvalidPath {
        path: path.to_path_buf(),
        reason: "cannot be made absolute",
    })?;
    CString::new(absolute.into_os_string().into_vec()).map_err(|_| Error::InvalidPath {
        path: path.to_path_buf(),
        reason: "contains a NUL byte",
    })
}

/// Lossless conversion back for diagnostics and handles.
pub(crate) fn path_of(c: &CStr) -> std::path::PathBuf {
    std::ffi::OsString::from_vec(c.to_bytes().to_vec()).into()
}

pub(crate) fn os_error(errno: i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(errno)
}

/// `unlink` treating `ENOENT` as success.
pub(crate) fn remove_file(path: &CStr) -> Result<()> {
    match sys::unlink(path) {
        Ok(()) | Err(libc::ENOENT) => Ok(()),
        Err(errno) => Err(Error::RemoveFile {
            path: path_of(path),
            source: os_error(errno),
        }),
    }
}

/// `rmdir` treating `ENOENT` as success.
pub(crate) fn remove_dir(path: &CStr) -> Result<()> {
    match sys::rmdir(path) {
        Ok(()) | Err(libc::ENOENT) => Ok(()),
        Err(errno) => Err(Error::RemoveDir {
            path: path_of(path),
            source: os_error(errno),
        }),
    }
}
