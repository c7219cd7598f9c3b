//! # tmpguard-abi
//!
//! `extern "C"` boundary for the temporary-resource registry.
//!
//! Functions return `0` (or a descriptor / pointer) on success and `-1`
//! (or `NULL`) on failure with `errno` set, like libc entry points. A
//! null string argument fails with `EINVAL`.
//!
//! Directory handles are opaque pointers; `tmpguard_cleanup_temp_dir`
//! frees the handle, after which it must not be used.

#![allow(clippy::missing_safety_doc)]

use std::ffi::{CStr, CString, OsStr, c_char, c_int};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use tmpguard_core::{Error, TempDir};

/// Opaque directory handle handed to C.
pub struct TmpguardTempDir {
    inner: TempDir,
    c_path: CString,
}

#[inline]
fn set_abi_errno(val: c_int) {
    // SAFETY: __errno_location always returns the calling thread's errno slot.
    unsafe { *libc::__errno_location() = val };
}

#[inline]
fn fail(err: &Error) -> c_int {
    set_abi_errno(err.raw_os_error().unwrap_or(libc::EIO));
    -1
}

#[inline]
fn status(result: tmpguard_core::Result<()>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(err) => fail(&err),
    }
}

/// Borrow a C string as a path.
///
/// # Safety
///
/// `p` is null or points to a NUL-terminated string that outlives `'a`.
#[inline]
unsafe fn path_arg<'a>(p: *const c_char) -> Option<&'a Path> {
    if p.is_null() {
        return None;
    }
    // SAFETY: caller guarantees a valid NUL-terminated string.
    let bytes = unsafe { CStr::from_ptr(p) }.to_bytes();
    Some(Path::new(OsStr::from_bytes(bytes)))
}

/// Borrow a directory handle.
///
/// # Safety
///
/// `dir` is null or a live pointer from [`tmpguard_create_temp_dir`].
#[inline]
unsafe fn dir_arg<'a>(dir: *mut TmpguardTempDir) -> Option<&'a TempDir> {
    // SAFETY: caller guarantees the pointer is live or null.
    unsafe { dir.as_ref() }.map(|d| &d.inner)
}

macro_rules! require {
    ($opt:expr) => {
        match $opt {
            Some(v) => v,
            None => {
                set_abi_errno(libc::EINVAL);
                return -1;
            }
        }
    };
}

// -------------------------------------------------------------------------
// Flat temp files
// -------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tmpguard_register_temporary_file(path: *const c_char) -> c_int {
    let path = require!(unsafe { path_arg(path) });
    status(tmpguard_core::register_temporary_file(path))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tmpguard_unregister_temporary_file(path: *const c_char) -> c_int {
    let path = require!(unsafe { path_arg(path) });
    tmpguard_core::unregister_temporary_file(path);
    0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tmpguard_cleanup_temporary_file(path: *const c_char, verbose: c_int) -> c_int {
    let path = require!(unsafe { path_arg(path) });
    status(tmpguard_core::cleanup_temporary_file(path, verbose != 0))
}

// -------------------------------------------------------------------------
// Temp directories
// -------------------------------------------------------------------------

/// Create a temporary directory. `parentdir` may be null for the default
/// location. Returns null with `errno` set on failure.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tmpguard_create_temp_dir(
    prefix: *const c_char,
    parentdir: *const c_char,
    verbose: c_int,
) -> *mut TmpguardTempDir {
    let prefix = if prefix.is_null() {
        ""
    } else {
        // SAFETY: caller passes a NUL-terminated string.
        match unsafe { CStr::from_ptr(prefix) }.to_str() {
            Ok(s) => s,
            Err(_) => {
                set_abi_errno(libc::EINVAL);
                return ptr::null_mut();
            }
        }
    };
    // SAFETY: parentdir is null or a NUL-terminated string.
    let parent = unsafe { path_arg(parentdir) };
    match tmpguard_core::create_temp_dir(prefix, parent, verbose != 0) {
        Ok(inner) => match CString::new(inner.path().as_os_str().as_bytes()) {
            Ok(c_path) => Box::into_raw(Box::new(TmpguardTempDir { inner, c_path })),
            Err(_) => {
                set_abi_errno(libc::EINVAL);
                ptr::null_mut()
            }
        },
        Err(err) => {
            fail(&err);
            ptr::null_mut()
        }
    }
}

/// Path of a directory handle. Valid until the handle is cleaned up.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tmpguard_temp_dir_path(dir: *mut TmpguardTempDir) -> *const c_char {
    match unsafe { dir.as_ref() } {
        Some(d) => d.c_path.as_ptr(),
        None => {
            set_abi_errno(libc::EINVAL);
            ptr::null()
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tmpguard_register_temp_file(dir: *mut TmpguardTempDir, path: *const c_char) -> c_int {
    let dir = require!(unsafe { dir_arg(dir) });
    let path = require!(unsafe { path_arg(path) });
    status(tmpguard_core::register_temp_file(dir, path))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tmpguard_unregister_temp_file(dir: *mut TmpguardTempDir, path: *const c_char) -> c_int {
    let dir = require!(unsafe { dir_arg(dir) });
    let path = require!(unsafe { path_arg(path) });
    tmpguard_core::unregister_temp_file(dir, path);
    0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tmpguard_register_temp_subdir(dir: *mut TmpguardTempDir, path: *const c_char) -> c_int {
    let dir = require!(unsafe { dir_arg(dir) });
    let path = require!(unsafe { path_arg(path) });
    status(tmpguard_core::register_temp_subdir(dir, path))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tmpguard_unregister_temp_subdir(dir: *mut TmpguardTempDir, path: *const c_char) -> c_int {
    let dir = require!(unsafe { dir_arg(dir) });
    let path = require!(unsafe { path_arg(path) });
    tmpguard_core::unregister_temp_subdir(dir, path);
    0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tmpguard_cleanup_temp_file(dir: *mut TmpguardTempDir, path: *const c_char) -> c_int {
    let dir = require!(unsafe { dir_arg(dir) });
    let path = require!(unsafe { path_arg(path) });
    status(tmpguard_core::cleanup_temp_file(dir, path))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tmpguard_cleanup_temp_subdir(dir: *mut TmpguardTempDir, path: *const c_char) -> c_int {
    let dir = require!(unsafe { dir_arg(dir) });
    let path = require!(unsafe { path_arg(path) });
    status(tmpguard_core::cleanup_temp_subdir(dir, path))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tmpguard_cleanup_temp_dir_contents(dir: *mut TmpguardTempDir) -> c_int {
    let dir = require!(unsafe { dir_arg(dir) });
    status(tmpguard_core::cleanup_temp_dir_contents(dir))
}

/// Remove the directory tree and free `dir`. The handle is freed even when
/// removal fails.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tmpguard_cleanup_temp_dir(dir: *mut TmpguardTempDir) -> c_int {
    if dir.is_null() {
        set_abi_errno(libc::EINVAL);
        return -1;
    }
    // SAFETY: non-null handles come from Box::into_raw in tmpguard_create_temp_dir.
    let boxed = unsafe { Box::from_raw(dir) };
    status(tmpguard_core::cleanup_temp_dir(boxed.inner))
}

// -------------------------------------------------------------------------
// Descriptors
// -------------------------------------------------------------------------

/// `open()` and register. Returns the descriptor or -1.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tmpguard_open_temp(
    path: *const c_char,
    flags: c_int,
    mode: libc::mode_t,
    delete_on_close: c_int,
) -> c_int {
    let path = require!(unsafe { path_arg(path) });
    match tmpguard_core::open_temp(path, flags, mode as u32, delete_on_close != 0) {
        Ok(fd) => fd.into_raw(),
        Err(err) => fail(&err),
    }
}

/// Close a descriptor returned by [`tmpguard_open_temp`].
#[unsafe(no_mangle)]
pub extern "C" fn tmpguard_close_temp(fd: c_int) -> c_int {
    status(tmpguard_core::close_temp_raw(fd))
}
