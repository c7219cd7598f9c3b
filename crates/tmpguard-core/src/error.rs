//! Error types for the temporary-resource registry.
//!
//! Explicit cleanup paths return these to the caller. The fatal-signal path
//! never constructs them: there is no safe reporting channel inside a handler.

use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for registry operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot remove temporary file {}: {source}", path.display())]
    RemoveFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot remove temporary directory {}: {source}", path.display())]
    RemoveDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot create a temporary directory using template {}: {source}", template.display())]
    CreateDir {
        template: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot find a temporary directory, try setting $TMPDIR")]
    NoTempDir,

    #[error("cannot open temporary file {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot close temporary file descriptor {fd}: {source}")]
    Close {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    #[error("write error on temporary file: {source}")]
    Write {
        #[source]
        source: io::Error,
    },

    #[error("file descriptor {fd} is not registered as a temporary descriptor")]
    UnregisteredDescriptor { fd: RawFd },

    #[error("temporary directory handle for slot {slot} no longer refers to a live directory")]
    StaleDirHandle { slot: usize },

    #[error("invalid stream mode {mode:?}")]
    InvalidMode { mode: String },

    #[error("invalid temporary path {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: &'static str },

    #[error("cannot install fatal-signal handler for signal {signal}: {source}")]
    SignalInstall {
        signal: i32,
        #[source]
        source: io::Error,
    },

    #[error("too many fatal-signal actions registered (capacity {capacity})")]
    ActionTableFull { capacity: usize },

    #[error("registry already initialized; configuration must be installed before first use")]
    AlreadyConfigured,
}

impl Error {
    /// The underlying OS errno, if this error carries one.
    ///
    /// Misuse errors map to `EBADF`/`EINVAL` so that the C boundary can
    /// always set a meaningful `errno`.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::RemoveFile { source, .. }
            | Self::RemoveDir { source, .. }
            | Self::CreateDir { source, .. }
            | Self::Open { source, .. }
            | Self::Close { source, .. }
            | Self::Write { source }
            | Self::SignalInstall { source, .. } => source.raw_os_error(),
            Self::NoTempDir => Some(libc::ENOENT),
            Self::UnregisteredDescriptor { .. } => Some(libc::EBADF),
            Self::StaleDirHandle { .. }
            | Self::InvalidMode { .. }
            | Self::InvalidPath { .. }
            | Self::AlreadyConfigured => Some(libc::EINVAL),
            Self::ActionTableFull { .. } => Some(libc::ENOMEM),
        }
    }

    /// Short machine-readable event name used by structured diagnostics.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::RemoveFile { .. } => "remove_file_failed",
            Self::RemoveDir { .. } => "remove_dir_failed",
            Self::CreateDir { .. } => "create_dir_failed",
            Self::NoTempDir => "no_temp_dir",
            Self::Open { .. } => "open_failed",
            Self::Close { .. } => "close_failed",
            Self::Write { .. } => "write_failed",
            Self::UnregisteredDescriptor { .. } => "unregistered_descriptor",
            Self::StaleDirHandle { .. } => "stale_dir_handle",
            Self::InvalidMode { .. } => "invalid_mode",
            Self::InvalidPath { .. } => "invalid_path",
            Self::SignalInstall { .. } => "signal_install_failed",
            Self::ActionTableFull { .. } => "action_table_full",
            Self::AlreadyConfigured => "already_configured",
        }
    }
}
