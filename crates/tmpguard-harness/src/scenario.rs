//! Victim scenarios.

use std::ffi::CString;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier, OnceLock};
use std::thread::JoinHandle;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tmpguard_core::{
    Registry, RegistryStats, TempDir, TempFd, TempStream, at_fatal_signal, close_temp, config,
    create_temp_dir, fopen_temp, gen_register_open_temp, open_temp, register_temp_file,
    register_temp_subdir, register_temporary_file, unregister_temporary_file,
};

use crate::Result;

/// What the victim registers before raising the signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    /// Three registered files outside any temp directory.
    FlatFiles,
    /// A temp directory with files and nested subdirectories.
    DirTree,
    /// Registered descriptors on generated files.
    Descriptors,
    /// Two flat files, one unregistered again before the crash.
    UnregisterThenCrash,
    /// A user action registered with `at_fatal_signal` plus a flat file.
    CustomAction,
    /// An open stream with unflushed output.
    Stream,
    /// A worker thread closing and reopening registered descriptors while
    /// the signal lands.
    CloseRace,
}

/// Printed by the victim right before it raises the signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub scenario: Scenario,
    pub pid: u32,
    pub signal: i32,
    /// Paths that must be gone after the crash.
    pub removed: Vec<PathBuf>,
    /// Paths that must survive the crash.
    pub kept: Vec<PathBuf>,
    /// Registered descriptor numbers.
    pub descriptors: Vec<i32>,
    pub stats: RegistryStats,
}

/// Handles the victim keeps alive until it dies. Dropping them would run
/// the explicit cleanup instead.
#[derive(Debug)]
pub enum Held {
    Dir(TempDir),
    Fd(TempFd),
    Stream(TempStream),
    Worker(JoinHandle<()>),
}

const RACE_FILES: usize = 32;

/// Close each descriptor and reopen its file, forever. Reopening never
/// creates: once a cleanup pass has unlinked a file it stays gone.
fn churn(paths: Vec<PathBuf>, mut fds: Vec<Option<TempFd>>, start: Arc<Barrier>) {
    start.wait();
    loop {
        for (path, slot) in paths.iter().zip(fds.iter_mut()) {
            if let Some(fd) = slot.take() {
                let _ = close_temp(fd);
            }
            *slot = open_temp(path, libc::O_RDWR, 0, false).ok();
        }
    }
}

static MARKER: OnceLock<CString> = OnceLock::new();

fn remove_marker(_sig: i32) {
    if let Some(path) = MARKER.get() {
        let _ = tmpguard_core::sys::unlink(path);
    }
}

fn touch(path: &Path) -> Result<()> {
    std::fs::write(path, b"tmpguard victim\n")?;
    Ok(())
}

/// Build `scenario` under `dir`.
pub fn prepare(scenario: Scenario, dir: &Path, signal: i32) -> Result<(Manifest, Vec<Held>)> {
    std::fs::create_dir_all(dir)?;
    let mut removed = Vec::new();
    let mut kept = Vec::new();
    let mut descriptors = Vec::new();
    let mut held = Vec::new();

    match scenario {
        Scenario::FlatFiles => {
            for name in ["one.tmp", "two.tmp", "three.tmp"] {
                let path = dir.join(name);
                register_temporary_file(&path)?;
                touch(&path)?;
                removed.push(path);
            }
        }
        Scenario::DirTree => {
            let tdir = create_temp_dir("victim", Some(dir), true)?;
            let root = tdir.path().to_path_buf();
            register_temp_subdir(&tdir, "sub")?;
            std::fs::create_dir(root.join("sub"))?;
            register_temp_subdir(&tdir, "sub/deeper")?;
            std::fs::create_dir(root.join("sub/deeper"))?;
            for file in ["a.tmp", "sub/b.tmp", "sub/deeper/c.tmp"] {
                register_temp_file(&tdir, file)?;
                touch(&root.join(file))?;
                removed.push(root.join(file));
            }
            removed.extend([root.join("sub/deeper"), root.join("sub"), root]);
            held.push(Held::Dir(tdir));
        }
        Scenario::Descriptors => {
            let tdir = create_temp_dir("fds", Some(dir), true)?;
            for _ in 0..3 {
                let (path, fd) = gen_register_open_temp(Some(&tdir), "gen", ".bin")?;
                descriptors.push(fd.as_raw_fd());
                removed.push(path);
                held.push(Held::Fd(fd));
            }
            removed.push(tdir.path().to_path_buf());
            held.push(Held::Dir(tdir));

            let flat = dir.join("flat-fd.tmp");
            register_temporary_file(&flat)?;
            let fd = open_temp(&flat, libc::O_CREAT | libc::O_RDWR, 0o600, false)?;
            descriptors.push(fd.as_raw_fd());
            removed.push(flat);
            held.push(Held::Fd(fd));
        }
        Scenario::UnregisterThenCrash => {
            let f1 = dir.join("f1.tmp");
            let f2 = dir.join("f2.tmp");
            for f in [&f1, &f2] {
                register_temporary_file(f)?;
                touch(f)?;
            }
            unregister_temporary_file(&f1);
            kept.push(f1);
            removed.push(f2);
        }
        Scenario::CustomAction => {
            let marker = dir.join("marker");
            touch(&marker)?;
            let c = CString::new(marker.as_os_str().as_bytes()).map_err(std::io::Error::other)?;
            let _ = MARKER.set(c);
            at_fatal_signal(remove_marker)?;
            removed.push(marker);

            let file = dir.join("with-action.tmp");
            register_temporary_file(&file)?;
            touch(&file)?;
            removed.push(file);
        }
        Scenario::Stream => {
            let path = dir.join("stream.tmp");
            register_temporary_file(&path)?;
            let mut stream = fopen_temp(&path, "w", false)?;
            stream.write_all(b"never flushed")?;
            descriptors.push(stream.as_raw_fd());
            removed.push(path);
            held.push(Held::Stream(stream));
        }
        Scenario::CloseRace => {
            let mut fds = Vec::with_capacity(RACE_FILES);
            for i in 0..RACE_FILES {
                let path = dir.join(format!("race-{i}.tmp"));
                register_temporary_file(&path)?;
                let fd = open_temp(&path, libc::O_CREAT | libc::O_RDWR, 0o600, false)?;
                descriptors.push(fd.as_raw_fd());
                fds.push(Some(fd));
                removed.push(path);
            }
            let start = Arc::new(Barrier::new(2));
            let worker = {
                let paths = removed.clone();
                let start = Arc::clone(&start);
                std::thread::spawn(move || churn(paths, fds, start))
            };
            start.wait();
            held.push(Held::Worker(worker));
        }
    }

    let manifest = Manifest {
        scenario,
        pid: std::process::id(),
        signal,
        removed,
        kept,
        descriptors,
        stats: Registry::global().stats(),
    };
    Ok((manifest, held))
}

/// Output of `harness signals`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalReport {
    pub fatal_signals: Vec<i32>,
    pub names: Vec<String>,
}

/// The fatal set the registry installed its handler for.
#[must_use]
pub fn signal_report() -> SignalReport {
    let _ = tmpguard_core::fatal::ensure_initialized();
    let fatal_signals = tmpguard_core::fatal_signals();
    let names = fatal_signals.iter().map(|&s| config::signal_name(s)).collect();
    SignalReport {
        fatal_signals,
        names,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_names_are_kebab_case() {
        let json = serde_json::to_string(&Scenario::UnregisterThenCrash).unwrap();
        assert_eq!(json, "\"unregister-then-crash\"");
        let parsed = Scenario::from_str("dir-tree", true).unwrap();
        assert_eq!(parsed, Scenario::DirTree);
    }
}
