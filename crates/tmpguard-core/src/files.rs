//! Temporary files that belong to no temporary directory.
//!
//! Register a path before creating the file, unregister it after removing
//! the file (or after creating it failed). Until then a fatal signal
//! unlinks it.

use std::path::Path;

use crate::diag;
use crate::error::Result;
use crate::registry::{self, Registry};

/// Register `path` for removal on a fatal signal. Registering the same
/// path twice keeps a single entry.
pub fn register_temporary_file(path: impl AsRef<Path>) -> Result<()> {
    let registry = Registry::global();
    let c = registry::c_path(path.as_ref())?;
    registry.files.insert_front(c.clone(), c);
    registry.reclaim();
    Ok(())
}

/// Forget `path`. Returns whether it was registered.
pub fn unregister_temporary_file(path: impl AsRef<Path>) -> bool {
    let registry = Registry::global();
    let Ok(c) = registry::c_path(path.as_ref()) else {
        return false;
    };
    let removed = registry.files.remove(c.as_c_str(), &registry.bin);
    registry.reclaim();
    removed
}

/// Remove `path` from disk, then unregister it.
///
/// A file that is already gone counts as removed. The path is unregistered
/// even when removal fails.
pub fn cleanup_temporary_file(path: impl AsRef<Path>, verbose: bool) -> Result<()> {
    let registry = Registry::global();
    let c = registry::c_path(path.as_ref())?;
    let removed = registry::remove_file(&c);
    registry.files.remove(c.as_c_str(), &registry.bin);
    registry.reclaim();
    removed.map_err(|err| diag::report(err, verbose))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::reclaim::TEST_LOCK;
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tmpguard-files-{}-{name}", std::process::id()))
    }

    fn registered(path: &Path) -> bool {
        let c = registry::c_path(path).unwrap();
        Registry::global().files.contains(c.as_c_str())
    }

    #[test]
    fn register_and_unregister() {
        let _g = TEST_LOCK.lock();
        let path = scratch("reg");
        register_temporary_file(&path).unwrap();
        register_temporary_file(&path).unwrap();
        assert!(registered(&path));
        assert!(unregister_temporary_file(&path));
        assert!(!registered(&path));
        assert!(!unregister_temporary_file(&path));
    }

    #[test]
    fn cleanup_twice_is_idempotent() {
        let _g = TEST_LOCK.lock();
        let path = scratch("twice");
        register_temporary_file(&path).unwrap();
        std::fs::write(&path, b"x").unwrap();
        cleanup_temporary_file(&path, false).unwrap();
        assert!(!path.exists());
        assert!(!registered(&path));
        cleanup_temporary_file(&path, false).unwrap();
    }

    #[test]
    fn cleanup_failure_still_unregisters() {
        let _g = TEST_LOCK.lock();
        // unlink() on a directory fails with EISDIR (Linux) or EPERM.
        let path = scratch("is-a-dir");
        std::fs::create_dir_all(&path).unwrap();
        register_temporary_file(&path).unwrap();
        let err = cleanup_temporary_file(&path, false).unwrap_err();
        assert!(matches!(err, Error::RemoveFile { .. }));
        assert!(!registered(&path));
        std::fs::remove_dir(&path).unwrap();
    }

    #[test]
    fn invalid_path_is_rejected() {
        let _g = TEST_LOCK.lock();
        assert!(matches!(
            register_temporary_file("nul\0inside"),
            Err(Error::InvalidPath { .. })
        ));
        assert!(!unregister_temporary_file("nul\0inside"));
    }
}
