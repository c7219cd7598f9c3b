//! # tmpguard-core
//!
//! Crash-safe registry of temporary files, temporary directories and open
//! descriptors.
//!
//! Everything registered here is removed (files, directories) or closed
//! (descriptors) when the process is killed by a fatal signal, from inside
//! the signal handler, without allocating and without taking any lock a
//! preempted thread could hold. Explicit cleanup calls do the same work
//! outside signal context and report errors.
//!
//! ```no_run
//! use tmpguard_core::{cleanup_temp_dir, create_temp_dir, register_temp_file};
//!
//! let dir = create_temp_dir("build", None, true)?;
//! register_temp_file(&dir, "out.o")?;
//! std::fs::write(dir.path().join("out.o"), b"...")?;
//! cleanup_temp_dir(dir)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod descriptors;
pub mod diag;
pub mod dirs;
pub mod error;
pub mod fatal;
pub mod files;
#[allow(unsafe_code)]
pub mod list;
pub mod reclaim;
pub mod registry;
#[allow(unsafe_code)]
pub mod sigset;
#[allow(unsafe_code)]
pub mod slots;
pub mod spin;
pub mod stream;
#[allow(unsafe_code)]
pub mod sys;

pub use config::{Config, LogSink, configure};
pub use descriptors::{TempFd, close_temp, close_temp_raw, gen_register_open_temp, open_temp, register_fd};
pub use dirs::{
    TempDir, cleanup_temp_dir, cleanup_temp_dir_contents, cleanup_temp_file, cleanup_temp_subdir,
    create_temp_dir, register_temp_file, register_temp_subdir, unregister_temp_file,
    unregister_temp_subdir,
};
pub use error::{Error, Result};
pub use fatal::{
    FatalSignalsBlocked, at_fatal_signal, block_fatal_signals, fatal_signals, unblock_fatal_signals,
};
pub use files::{cleanup_temporary_file, register_temporary_file, unregister_temporary_file};
pub use registry::{Registry, RegistryStats, run_cleanup_now};
pub use stream::{OpenMode, TempStream, fclose_temp, fopen_temp, fwriteerror_temp};
