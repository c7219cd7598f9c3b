//! Registered file descriptors.
//!
//! A descriptor may be closed by its owner or by the fatal-signal handler,
//! possibly at the same moment on different threads. Each record carries a
//! [`SigSpinLock`]; whoever takes it first and finds `closed` unset issues
//! the one `close()`. The handler only ever sets `closed`; the owner sets
//! `done`, after which the record is swept from the list.

use std::ffi::CString;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::dirs::{self, TempDir};
use crate::error::{Error, Result};
use crate::fatal::FatalSignalsBlocked;
use crate::registry::{self, Registry};
use crate::sigset::SignalSet;
use crate::spin::SigSpinLock;
use crate::sys;

static OS_CLOSES: AtomicU64 = AtomicU64::new(0);

/// Total `close()` calls issued on registered descriptors.
pub(crate) fn os_close_count() -> u64 {
    OS_CLOSES.load(Ordering::Acquire)
}

pub(crate) struct FdRecord {
    fd: RawFd,
    lock: SigSpinLock,
    closed: AtomicBool,
    done: AtomicBool,
    /// Unlinked (and unregistered) after the owner closes.
    unlink_on_close: Option<CString>,
}

impl FdRecord {
    /// Async-signal-safe.
    pub(crate) fn close_from_handler(&self, mask: &SignalSet) {
        let _guard = self.lock.lock(mask);
        if !self.closed.load(Ordering::Acquire) {
            OS_CLOSES.fetch_add(1, Ordering::AcqRel);
            let _ = sys::close(self.fd);
            self.closed.store(true, Ordering::Release);
        }
    }

    /// Owner-side close. A descriptor already closed by a cleanup pass
    /// counts as success. Returns `None` if the owner already finished.
    fn close_by_owner(&self, mask: &SignalSet) -> Option<std::result::Result<(), i32>> {
        let _guard = self.lock.lock(mask);
        if self.done.load(Ordering::Acquire) {
            return None;
        }
        let result = if self.closed.load(Ordering::Acquire) {
            Ok(())
        } else {
            OS_CLOSES.fetch_add(1, Ordering::AcqRel);
            let result = sys::close(self.fd);
            self.closed.store(true, Ordering::Release);
            result
        };
        self.done.store(true, Ordering::Release);
        Some(result)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// An open, registered descriptor. Closed through the registry on drop.
pub struct TempFd {
    record: Option<Arc<FdRecord>>,
    fd: RawFd,
}

impl TempFd {
    /// Close the descriptor, reporting the OS error if any.
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    /// Give up ownership without closing. The descriptor stays registered
    /// and must eventually be passed to [`close_temp_raw`].
    #[must_use]
    pub fn into_raw(mut self) -> RawFd {
        self.record = None;
        self.fd
    }

    fn close_inner(&mut self) -> Result<()> {
        match self.record.take() {
            Some(record) => finish_close(Registry::global(), &record),
            None => Ok(()),
        }
    }
}

impl AsRawFd for TempFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TempFd {
    fn drop(&mut self) {
        let _ = self.close_inner();
    }
}

impl std::fmt::Debug for TempFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempFd")
            .field("fd", &self.fd)
            .field("owned", &self.record.is_some())
            .finish()
    }
}

fn track(registry: &'static Registry, fd: RawFd, unlink_on_close: Option<CString>) -> TempFd {
    let record = Arc::new(FdRecord {
        fd,
        lock: SigSpinLock::new(),
        closed: AtomicBool::new(false),
        done: AtomicBool::new(false),
        unlink_on_close,
    });
    registry
        .descriptors
        .insert_front(registry.next_fd_id(), Arc::clone(&record));
    registry.reclaim();
    TempFd {
        record: Some(record),
        fd,
    }
}

fn finish_close(registry: &'static Registry, record: &Arc<FdRecord>) -> Result<()> {
    let closed = record.close_by_owner(&registry.mask);
    registry.descriptors.remove_where(|_, r| r.is_done(), &registry.bin);
    registry.reclaim();
    match closed {
        Some(Ok(())) => {}
        Some(Err(errno)) => {
            return Err(Error::Close {
                fd: record.fd,
                source: registry::os_error(errno),
            });
        }
        None => return Err(Error::UnregisteredDescriptor { fd: record.fd }),
    }
    if let Some(path) = &record.unlink_on_close {
        // Stays registered until it is gone from disk.
        let removed = registry::remove_file(path);
        registry.files.remove(path.as_c_str(), &registry.bin);
        registry.reclaim();
        removed?;
    }
    Ok(())
}

/// Register an already-open descriptor.
pub fn register_fd(fd: OwnedFd) -> TempFd {
    track(Registry::global(), fd.into_raw_fd(), None)
}

/// `open()` a file and register the resulting descriptor.
///
/// Fatal signals are blocked from the `open` until the descriptor is
/// registered. With `delete_on_close`, the file is unlinked (and
/// unregistered from the flat file list) once the owner closes it.
pub fn open_temp(path: impl AsRef<Path>, flags: i32, mode: u32, delete_on_close: bool) -> Result<TempFd> {
    let registry = Registry::global();
    let path = path.as_ref();
    let c = registry::c_path(path)?;
    let _blocked = FatalSignalsBlocked::new();
    let fd = sys::open(&c, flags, mode).map_err(|errno| Error::Open {
        path: path.to_path_buf(),
        source: registry::os_error(errno),
    })?;
    Ok(track(registry, fd, delete_on_close.then_some(c)))
}

/// Close a registered descriptor owned by `fd`.
pub fn close_temp(fd: TempFd) -> Result<()> {
    fd.close()
}

/// Close a registered descriptor by number, as C callers do.
///
/// Fails with [`Error::UnregisteredDescriptor`] if no unfinished record
/// has this number.
pub fn close_temp_raw(fd: RawFd) -> Result<()> {
    let registry = Registry::global();
    let mut found = None;
    registry.descriptors.for_each_locked(|record| {
        if found.is_none() && record.fd == fd && !record.is_done() {
            found = Some(Arc::clone(record));
        }
    });
    match found {
        Some(record) => finish_close(registry, &record),
        None => Err(Error::UnregisteredDescriptor { fd }),
    }
}

/// Create a uniquely named file `<prefix>XXXXXX<suffix>` and register both
/// its path and its descriptor.
///
/// The file lands in `dir` (and is registered there) when given, otherwise
/// in the default temporary directory and the flat file list. It is
/// created with mode `0600`. Fatal signals are blocked from creation until
/// both registrations are done.
pub fn gen_register_open_temp(dir: Option<&TempDir>, prefix: &str, suffix: &str) -> Result<(PathBuf, TempFd)> {
    let registry = Registry::global();
    let base = match dir {
        Some(dir) => dir.path().to_path_buf(),
        None => dirs::default_base_dir()?,
    };
    let template_path = base.join(format!("{prefix}XXXXXX{suffix}"));
    let mut template = registry::c_path(&template_path)?.into_bytes_with_nul();
    let _blocked = FatalSignalsBlocked::new();
    let fd = sys::mkstemps(&mut template, suffix.len()).map_err(|errno| Error::Open {
        path: template_path.clone(),
        source: registry::os_error(errno),
    })?;
    let c = CString::from_vec_with_nul(template).map_err(|_| Error::InvalidPath {
        path: template_path,
        reason: "contains a NUL byte",
    })?;
    let path = registry::path_of(&c);
    match dir {
        Some(dir) => dir.register_c_file(c),
        None => {
            registry.files.insert_front(c.clone(), c);
        }
    }
    Ok((path, track(registry, fd, None)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reclaim::TEST_LOCK;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tmpguard-fd-{}-{name}", std::process::id()))
    }

    fn is_open(fd: RawFd) -> bool {
        // F_GETFD on a closed descriptor fails with EBADF.
        #[allow(unsafe_code)]
        // SAFETY: fcntl with F_GETFD has no pointer arguments.
        let rc = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        rc != -1
    }

    #[test]
    fn open_and_close_updates_registry() {
        let _g = TEST_LOCK.lock();
        let path = scratch("open-close");
        let fd = open_temp(&path, libc::O_CREAT | libc::O_RDWR, 0o600, false).unwrap();
        let raw = fd.as_raw_fd();
        assert!(is_open(raw));
        close_temp(fd).unwrap();
        assert!(!is_open(raw));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn handler_close_then_owner_close_closes_once() {
        let _g = TEST_LOCK.lock();
        let registry = Registry::global();
        let path = scratch("handler-first");
        let fd = open_temp(&path, libc::O_CREAT | libc::O_RDWR, 0o600, true).unwrap();
        let record = Arc::clone(fd.record.as_ref().unwrap());
        let before = os_close_count();
        record.close_from_handler(&registry.mask);
        record.close_from_handler(&registry.mask);
        assert_eq!(os_close_count() - before, 1);
        fd.close().unwrap();
        assert_eq!(os_close_count() - before, 1);
        assert!(record.is_done());
        // delete_on_close removed the file.
        assert!(!path.exists());
    }

    #[test]
    fn delete_on_close_removes_registered_path() {
        let _g = TEST_LOCK.lock();
        let registry = Registry::global();
        let path = scratch("registered-doc");
        crate::files::register_temporary_file(&path).unwrap();
        let c = registry::c_path(&path).unwrap();
        let fd = open_temp(&path, libc::O_CREAT | libc::O_RDWR, 0o600, true).unwrap();
        assert!(path.exists());
        assert!(registry.files.contains(c.as_c_str()));
        close_temp(fd).unwrap();
        assert!(!path.exists());
        assert!(!registry.files.contains(c.as_c_str()));
    }

    #[test]
    fn raw_close_rejects_unknown_descriptor() {
        let _g = TEST_LOCK.lock();
        let err = close_temp_raw(-7).unwrap_err();
        assert!(matches!(err, Error::UnregisteredDescriptor { fd: -7 }));
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn raw_close_after_into_raw() {
        let _g = TEST_LOCK.lock();
        let path = scratch("into-raw");
        let fd = open_temp(&path, libc::O_CREAT | libc::O_WRONLY, 0o600, false).unwrap();
        let raw = fd.into_raw();
        assert!(is_open(raw));
        close_temp_raw(raw).unwrap();
        assert!(!is_open(raw));
        assert!(matches!(
            close_temp_raw(raw),
            Err(Error::UnregisteredDescriptor { .. })
        ));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn register_owned_fd() {
        let _g = TEST_LOCK.lock();
        let file = std::fs::File::create(scratch("owned")).unwrap();
        let owned: OwnedFd = file.into();
        let fd = register_fd(owned);
        let raw = fd.as_raw_fd();
        drop(fd);
        assert!(!is_open(raw));
        std::fs::remove_file(scratch("owned")).unwrap();
    }

    #[test]
    fn open_failure_reports_path() {
        let _g = TEST_LOCK.lock();
        let err = open_temp("/nonexistent-tmpguard/f", libc::O_RDONLY, 0, false).unwrap_err();
        assert!(matches!(err, Error::Open { .. }));
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn generated_file_is_registered_and_open() {
        let _g = TEST_LOCK.lock();
        let registry = Registry::global();
        let (path, fd) = gen_register_open_temp(None, "gen", ".dat").unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("gen") && name.ends_with(".dat"));
        assert!(path.exists());
        assert!(registry.files.contains(registry::c_path(&path).unwrap().as_c_str()));
        fd.close().unwrap();
        crate::files::cleanup_temporary_file(&path, false).unwrap();
        assert!(!path.exists());
    }
}
