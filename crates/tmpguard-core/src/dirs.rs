//! Temporary directories and the files and subdirectories inside them.
//!
//! Each live directory occupies one slot of the registry's [`SlotTable`].
//! The fatal-signal handler reaches a directory only through its slot, so
//! a record is never freed while a cleanup pass might be standing on it:
//! vacating the slot retires the slot's reference to the retire bin.
//!
//! [`SlotTable`]: crate::slots::SlotTable

use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::diag;
use crate::error::{Error, Result};
use crate::fatal::FatalSignalsBlocked;
use crate::list::SignalSafeList;
use crate::reclaim::CleanupPass;
use crate::registry::{self, Registry};
use crate::sys;

pub(crate) struct DirRecord {
    path: CString,
    files: SignalSafeList<CString, CString>,
    subdirs: SignalSafeList<CString, CString>,
}

impl DirRecord {
    /// Unlink files, remove subdirectories (newest first), then the
    /// directory itself. Async-signal-safe.
    pub(crate) fn remove_tree(&self, pass: &CleanupPass) {
        for file in self.files.iter(pass) {
            let _ = sys::unlink(file);
        }
        for subdir in self.subdirs.iter(pass) {
            let _ = sys::rmdir(subdir);
        }
        let _ = sys::rmdir(&self.path);
    }
}

/// A temporary directory created by [`create_temp_dir`].
///
/// Dropping the handle removes the directory and everything registered in
/// it; [`TempDir::cleanup`] does the same and reports errors.
pub struct TempDir {
    record: Arc<DirRecord>,
    path: PathBuf,
    slot: usize,
    verbose: bool,
    live: bool,
}

impl TempDir {
    /// Absolute path of the directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Index of the slot this directory occupies.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Whether cleanup errors are reported as diagnostics.
    #[must_use]
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Remove the directory tree and release the slot.
    pub fn cleanup(mut self) -> Result<()> {
        self.cleanup_inner()
    }

    /// Paths inside the directory may be given relative to it.
    fn resolve(&self, path: &Path) -> Result<CString> {
        registry::c_path(&self.path.join(path))
    }

    fn check_live(&self) -> Result<()> {
        if self.live && Registry::global().dirs.holds(self.slot, &self.record) {
            Ok(())
        } else {
            Err(Error::StaleDirHandle { slot: self.slot })
        }
    }

    pub(crate) fn register_c_file(&self, path: CString) {
        self.record.files.insert_front(path.clone(), path);
    }

    fn remove_registered_file(&self, path: &CStr) -> Result<()> {
        let registry = Registry::global();
        let removed = registry::remove_file(path);
        self.record.files.remove(path, &registry.bin);
        removed.map_err(|err| diag::report(err, self.verbose))
    }

    fn remove_registered_subdir(&self, path: &CStr) -> Result<()> {
        let registry = Registry::global();
        let removed = registry::remove_dir(path);
        self.record.subdirs.remove(path, &registry.bin);
        removed.map_err(|err| diag::report(err, self.verbose))
    }

    fn cleanup_contents(&self) -> Result<()> {
        let mut files = Vec::new();
        self.record.files.for_each_locked(|p| files.push(p.clone()));
        let mut subdirs = Vec::new();
        self.record.subdirs.for_each_locked(|p| subdirs.push(p.clone()));

        let mut first_err = None;
        for file in &files {
            if let Err(err) = self.remove_registered_file(file) {
                first_err.get_or_insert(err);
            }
        }
        for subdir in &subdirs {
            if let Err(err) = self.remove_registered_subdir(subdir) {
                first_err.get_or_insert(err);
            }
        }
        Registry::global().reclaim();
        first_err.map_or(Ok(()), Err)
    }

    fn cleanup_inner(&mut self) -> Result<()> {
        if !self.live {
            return Ok(());
        }
        self.live = false;
        let registry = Registry::global();
        let contents = self.cleanup_contents();
        let removed = registry::remove_dir(&self.record.path)
            .map_err(|err| diag::report(err, self.verbose));
        registry.dirs.vacate(self.slot, &self.record, &registry.bin);
        registry.reclaim();
        contents.and(removed)
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = self.cleanup_inner();
    }
}

impl std::fmt::Debug for TempDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempDir")
            .field("path", &self.path)
            .field("slot", &self.slot)
            .field("live", &self.live)
            .finish()
    }
}

/// `$TMPDIR` if it names a directory, else `/tmp`.
pub(crate) fn default_base_dir() -> Result<PathBuf> {
    let candidates = std::env::var_os("TMPDIR")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .into_iter()
        .chain(std::iter::once(PathBuf::from("/tmp")));
    for candidate in candidates {
        if candidate.is_dir() {
            return Ok(candidate);
        }
    }
    Err(Error::NoTempDir)
}

/// Create a fresh directory `<parent>/<prefix>XXXXXX` and register it.
///
/// Without `parent`, the directory goes under `$TMPDIR` or `/tmp`. An empty
/// prefix becomes `file`. Fatal signals are blocked only between creating
/// the directory and publishing its slot.
pub fn create_temp_dir(prefix: &str, parent: Option<&Path>, verbose: bool) -> Result<TempDir> {
    let registry = Registry::global();
    let base = match parent {
        Some(dir) => dir.to_path_buf(),
        None => default_base_dir()?,
    };
    let prefix = if prefix.is_empty() { "file" } else { prefix };
    let template_path = base.join(format!("{prefix}XXXXXX"));
    let mut template = registry::c_path(&template_path)?.into_bytes_with_nul();

    let reservation = registry.dirs.reserve(&registry.bin);
    let blocked = FatalSignalsBlocked::new();
    if let Err(errno) = sys::mkdtemp(&mut template) {
        drop(blocked);
        let err = Error::CreateDir {
            template: template_path,
            source: registry::os_error(errno),
        };
        return Err(diag::report(err, verbose));
    }
    let path = CString::from_vec_with_nul(template).map_err(|_| Error::InvalidPath {
        path: template_path,
        reason: "contains a NUL byte",
    })?;
    let record = Arc::new(DirRecord {
        path,
        files: SignalSafeList::new(),
        subdirs: SignalSafeList::new(),
    });
    let slot = reservation.publish(Arc::clone(&record));
    drop(blocked);
    registry.reclaim();

    Ok(TempDir {
        path: registry::path_of(&record.path),
        record,
        slot,
        verbose,
        live: true,
    })
}

/// Register a file inside `dir` for removal on a fatal signal.
pub fn register_temp_file(dir: &TempDir, path: impl AsRef<Path>) -> Result<()> {
    dir.check_live()?;
    dir.register_c_file(dir.resolve(path.as_ref())?);
    Registry::global().reclaim();
    Ok(())
}

/// Forget a file registered in `dir`. Returns whether it was registered.
pub fn unregister_temp_file(dir: &TempDir, path: impl AsRef<Path>) -> bool {
    let registry = Registry::global();
    let Ok(c) = dir.resolve(path.as_ref()) else {
        return false;
    };
    let removed = dir.record.files.remove(c.as_c_str(), &registry.bin);
    registry.reclaim();
    removed
}

/// Register a subdirectory of `dir` for removal on a fatal signal.
///
/// Subdirectories are removed newest first, so register parents before
/// their children.
pub fn register_temp_subdir(dir: &TempDir, path: impl AsRef<Path>) -> Result<()> {
    dir.check_live()?;
    let c = dir.resolve(path.as_ref())?;
    dir.record.subdirs.insert_front(c.clone(), c);
    Registry::global().reclaim();
    Ok(())
}

/// Forget a subdirectory registered in `dir`.
pub fn unregister_temp_subdir(dir: &TempDir, path: impl AsRef<Path>) -> bool {
    let registry = Registry::global();
    let Ok(c) = dir.resolve(path.as_ref()) else {
        return false;
    };
    let removed = dir.record.subdirs.remove(c.as_c_str(), &registry.bin);
    registry.reclaim();
    removed
}

/// Unlink a file in `dir` and unregister it, even if unlinking fails.
pub fn cleanup_temp_file(dir: &TempDir, path: impl AsRef<Path>) -> Result<()> {
    dir.check_live()?;
    let c = dir.resolve(path.as_ref())?;
    let result = dir.remove_registered_file(&c);
    Registry::global().reclaim();
    result
}

/// Remove a (now empty) subdirectory of `dir` and unregister it.
pub fn cleanup_temp_subdir(dir: &TempDir, path: impl AsRef<Path>) -> Result<()> {
    dir.check_live()?;
    let c = dir.resolve(path.as_ref())?;
    let result = dir.remove_registered_subdir(&c);
    Registry::global().reclaim();
    result
}

/// Remove every registered file, then every registered subdirectory.
/// The directory itself stays. Returns the first error.
pub fn cleanup_temp_dir_contents(dir: &TempDir) -> Result<()> {
    dir.check_live()?;
    dir.cleanup_contents()
}

/// Remove the directory's contents and the directory, then release its
/// slot. Consumes the handle.
pub fn cleanup_temp_dir(dir: TempDir) -> Result<()> {
    dir.cleanup()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reclaim::TEST_LOCK;

    fn parent() -> PathBuf {
        let p = std::env::temp_dir().join(format!("tmpguard-dirs-{}", std::process::id()));
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    #[test]
    fn create_uses_prefix_and_parent() {
        let _g = TEST_LOCK.lock();
        let dir = create_temp_dir("test", Some(&parent()), false).unwrap();
        assert!(dir.path().is_dir());
        assert!(dir.path().starts_with(parent()));
        let name = dir.path().file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("test"));
        assert_eq!(name.len(), "test".len() + 6);
        let path = dir.path().to_path_buf();
        cleanup_temp_dir(dir).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn empty_prefix_becomes_file() {
        let _g = TEST_LOCK.lock();
        let dir = create_temp_dir("", Some(&parent()), false).unwrap();
        let name = dir.path().file_name().unwrap().to_str().unwrap().to_owned();
        assert!(name.starts_with("file"));
    }

    #[test]
    fn missing_parent_is_create_error() {
        let _g = TEST_LOCK.lock();
        let err = create_temp_dir("x", Some(Path::new("/nonexistent-tmpguard")), false).unwrap_err();
        assert!(matches!(err, Error::CreateDir { .. }));
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn cleanup_removes_files_subdirs_and_dir() {
        let _g = TEST_LOCK.lock();
        let dir = create_temp_dir("test", Some(&parent()), false).unwrap();
        register_temp_file(&dir, "a.tmp").unwrap();
        std::fs::write(dir.path().join("a.tmp"), b"data").unwrap();
        register_temp_subdir(&dir, "sub").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        register_temp_file(&dir, "sub/b.tmp").unwrap();
        std::fs::write(dir.path().join("sub/b.tmp"), b"more").unwrap();

        let root = dir.path().to_path_buf();
        cleanup_temp_dir(dir).unwrap();
        assert!(!root.join("a.tmp").exists());
        assert!(!root.join("sub").exists());
        assert!(!root.exists());
    }

    #[test]
    fn contents_cleanup_keeps_directory() {
        let _g = TEST_LOCK.lock();
        let dir = create_temp_dir("keep", Some(&parent()), false).unwrap();
        register_temp_file(&dir, "x").unwrap();
        std::fs::write(dir.path().join("x"), b"").unwrap();
        cleanup_temp_dir_contents(&dir).unwrap();
        assert!(dir.path().is_dir());
        assert!(!dir.path().join("x").exists());
        // Nothing left registered: a second pass is a no-op.
        cleanup_temp_dir_contents(&dir).unwrap();
    }

    #[test]
    fn per_entry_cleanup_and_unregister() {
        let _g = TEST_LOCK.lock();
        let dir = create_temp_dir("entry", Some(&parent()), false).unwrap();
        register_temp_file(&dir, "f").unwrap();
        std::fs::write(dir.path().join("f"), b"").unwrap();
        cleanup_temp_file(&dir, "f").unwrap();
        assert!(!dir.path().join("f").exists());
        assert!(!unregister_temp_file(&dir, "f"));

        register_temp_subdir(&dir, "d").unwrap();
        std::fs::create_dir(dir.path().join("d")).unwrap();
        cleanup_temp_subdir(&dir, "d").unwrap();
        assert!(!dir.path().join("d").exists());

        register_temp_file(&dir, "kept").unwrap();
        assert!(unregister_temp_file(&dir, "kept"));
        std::fs::write(dir.path().join("kept"), b"").unwrap();
        let root = dir.path().to_path_buf();
        // The unregistered file keeps the directory non-empty.
        let err = cleanup_temp_dir(dir).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOTEMPTY));
        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn freed_slot_is_reused() {
        let _g = TEST_LOCK.lock();
        let a = create_temp_dir("slot", Some(&parent()), false).unwrap();
        let b = create_temp_dir("slot", Some(&parent()), false).unwrap();
        assert_ne!(a.slot(), b.slot());
        let freed = a.slot();
        cleanup_temp_dir(a).unwrap();
        let c = create_temp_dir("slot", Some(&parent()), false).unwrap();
        assert_eq!(c.slot(), freed);
        assert_ne!(c.slot(), b.slot());
    }

    #[test]
    fn drop_cleans_up() {
        let _g = TEST_LOCK.lock();
        let dir = create_temp_dir("drop", Some(&parent()), false).unwrap();
        register_temp_file(&dir, "f").unwrap();
        std::fs::write(dir.path().join("f"), b"").unwrap();
        let root = dir.path().to_path_buf();
        drop(dir);
        assert!(!root.exists());
    }

    #[test]
    fn cleanup_pass_removes_tree_without_freeing_record() {
        let _g = TEST_LOCK.lock();
        let dir = create_temp_dir("pass", Some(&parent()), false).unwrap();
        register_temp_subdir(&dir, "s").unwrap();
        std::fs::create_dir(dir.path().join("s")).unwrap();
        register_temp_file(&dir, "s/f").unwrap();
        std::fs::write(dir.path().join("s/f"), b"").unwrap();
        let root = dir.path().to_path_buf();
        crate::registry::run_cleanup_now();
        assert!(!root.exists());
        // The handle is still live; explicit cleanup sees ENOENT everywhere.
        assert!(dir.check_live().is_ok());
        cleanup_temp_dir(dir).unwrap();
    }
}
