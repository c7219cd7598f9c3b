//! Typed wrappers around the handful of POSIX calls the registry needs.
//!
//! Every wrapper returns `Result<_, i32>` carrying the raw errno, and none of
//! them allocate. `unlink`, `rmdir` and `close` are async-signal-safe and are
//! the only calls the fatal-signal handler makes against the filesystem.

use std::ffi::CStr;
use std::os::fd::RawFd;

// -------------------------------------------------------------------------
// Error handling
// -------------------------------------------------------------------------

/// Read the calling thread's `errno`.
#[inline]
pub fn errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

/// Convert a `-1`-on-error return into `Result<c_int, errno>`.
#[inline]
fn check(ret: libc::c_int) -> Result<libc::c_int, i32> {
    if ret == -1 { Err(errno()) } else { Ok(ret) }
}

// -------------------------------------------------------------------------
// Filesystem
// -------------------------------------------------------------------------

/// `unlink(path)`.
#[inline]
pub fn unlink(path: &CStr) -> Result<(), i32> {
    // SAFETY: `path` is a valid NUL-terminated string for the duration of the call.
    check(unsafe { libc::unlink(path.as_ptr()) }).map(|_| ())
}

/// `rmdir(path)`.
#[inline]
pub fn rmdir(path: &CStr) -> Result<(), i32> {
    // SAFETY: `path` is a valid NUL-terminated string for the duration of the call.
    check(unsafe { libc::rmdir(path.as_ptr()) }).map(|_| ())
}

/// `open(path, flags, mode)`, always adding `O_CLOEXEC`.
#[inline]
pub fn open(path: &CStr, flags: i32, mode: u32) -> Result<RawFd, i32> {
    // SAFETY: `path` is a valid NUL-terminated string; mode is passed as the
    // variadic third argument exactly as the C prototype expects.
    check(unsafe { libc::open(path.as_ptr(), flags | libc::O_CLOEXEC, mode as libc::c_uint) })
}

/// `close(fd)`. Closing an arbitrary number is safe: a bad fd yields `EBADF`.
#[inline]
pub fn close(fd: RawFd) -> Result<(), i32> {
    // SAFETY: close has no pointer arguments.
    check(unsafe { libc::close(fd) }).map(|_| ())
}

/// `mkdtemp(template)`. `template` must end in `XXXXXX\0`; it is rewritten
/// in place with the created directory name.
pub fn mkdtemp(template: &mut [u8]) -> Result<(), i32> {
    if template.last() != Some(&0) {
        return Err(libc::EINVAL);
    }
    // SAFETY: template is a writable NUL-terminated buffer we own.
    let ret = unsafe { libc::mkdtemp(template.as_mut_ptr().cast::<libc::c_char>()) };
    if ret.is_null() { Err(errno()) } else { Ok(()) }
}

/// `mkstemps(template, suffixlen)` followed by `FD_CLOEXEC`.
pub fn mkstemps(template: &mut [u8], suffix_len: usize) -> Result<RawFd, i32> {
    if template.last() != Some(&0) {
        return Err(libc::EINVAL);
    }
    let suffix_len = libc::c_int::try_from(suffix_len).map_err(|_| libc::EINVAL)?;
    // SAFETY: template is a writable NUL-terminated buffer we own.
    let fd = check(unsafe {
        libc::mkstemps(template.as_mut_ptr().cast::<libc::c_char>(), suffix_len)
    })?;
    // SAFETY: fd was just returned by mkstemps.
    unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    Ok(fd)
}

// -------------------------------------------------------------------------
// Signals
// -------------------------------------------------------------------------

/// `raise(sig)`.
#[inline]
pub fn raise(sig: i32) -> Result<(), i32> {
    // SAFETY: raise has no pointer arguments.
    check(unsafe { libc::raise(sig) }).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlink_missing_path_reports_enoent() {
        let path = c"/nonexistent-tmpguard-dir/never-there";
        assert_eq!(unlink(path), Err(libc::ENOENT));
        assert_eq!(rmdir(path), Err(libc::ENOENT));
    }

    #[test]
    fn close_bad_fd_reports_ebadf() {
        assert_eq!(close(-1), Err(libc::EBADF));
    }

    #[test]
    fn mkdtemp_rejects_unterminated_template() {
        let mut template = b"/tmp/tmpguardXXXXXX".to_vec();
        assert_eq!(mkdtemp(&mut template), Err(libc::EINVAL));
    }

    #[test]
    fn mkdtemp_then_rmdir_roundtrip() {
        let mut template = std::env::temp_dir()
            .join("tmpguard-sysXXXXXX")
            .into_os_string()
            .into_encoded_bytes();
        template.push(0);
        mkdtemp(&mut template).unwrap();
        let created = CStr::from_bytes_with_nul(&template).unwrap();
        assert!(!created.to_bytes().ends_with(b"XXXXXX"));
        rmdir(created).unwrap();
    }
}
