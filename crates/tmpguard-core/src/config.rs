//! Registry configuration.
//!
//! Resolved once, before the fatal-signal handler is installed, from either
//! [`configure`] or the environment:
//! - `TMPGUARD_FATAL_SIGNALS`: comma-separated adjustments to the default
//!   fatal set. `SEGV`, `SIGSEGV` and `11` all name the same signal; a
//!   leading `-` removes it instead (`-PIPE`).
//! - `TMPGUARD_LOG`: where verbose cleanup diagnostics go. `stderr`
//!   (default), `off`, or any other value as a file path opened for append.
//!
//! The resolved config is frozen by the first registry operation. Calling
//! [`configure`] afterwards fails with [`Error::AlreadyConfigured`].

use std::path::PathBuf;
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// Signals whose default action terminates the process and that programs
/// rarely use for other purposes. `SIGALRM` is left out on purpose.
pub const DEFAULT_FATAL_SIGNALS: &[i32] = &[
    libc::SIGINT,
    libc::SIGTERM,
    libc::SIGHUP,
    libc::SIGPIPE,
    libc::SIGXCPU,
    libc::SIGXFSZ,
];

/// Destination for structured diagnostics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum LogSink {
    #[default]
    Stderr,
    Off,
    File(PathBuf),
}

impl LogSink {
    /// Parse a `TMPGUARD_LOG` value.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim() {
            "" => Self::Stderr,
            v if v.eq_ignore_ascii_case("stderr") => Self::Stderr,
            v if v.eq_ignore_ascii_case("off") || v.eq_ignore_ascii_case("none") => Self::Off,
            path => Self::File(PathBuf::from(path)),
        }
    }
}

/// Registry configuration.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Config {
    /// Signals added to [`DEFAULT_FATAL_SIGNALS`].
    pub extra_signals: Vec<i32>,
    /// Signals removed from the default set.
    pub removed_signals: Vec<i32>,
    pub log_sink: LogSink,
}

impl Config {
    /// Read `TMPGUARD_FATAL_SIGNALS` and `TMPGUARD_LOG`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(raw) = std::env::var("TMPGUARD_FATAL_SIGNALS") {
            cfg.apply_signal_spec(&raw);
        }
        if let Ok(raw) = std::env::var("TMPGUARD_LOG") {
            cfg.log_sink = LogSink::from_str_loose(&raw);
        }
        cfg
    }

    /// Treat `sig` as fatal in addition to the defaults.
    #[must_use]
    pub fn with_signal(mut self, sig: i32) -> Self {
        self.removed_signals.retain(|&s| s != sig);
        if !self.extra_signals.contains(&sig) {
            self.extra_signals.push(sig);
        }
        self
    }

    /// Do not treat `sig` as fatal.
    #[must_use]
    pub fn without_signal(mut self, sig: i32) -> Self {
        self.extra_signals.retain(|&s| s != sig);
        if !self.removed_signals.contains(&sig) {
            self.removed_signals.push(sig);
        }
        self
    }

    #[must_use]
    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.log_sink = sink;
        self
    }

    /// Apply a comma-separated adjustment list. Unknown names are skipped.
    pub fn apply_signal_spec(&mut self, spec: &str) {
        for item in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (remove, name) = match item.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, item.strip_prefix('+').unwrap_or(item)),
            };
            if let Some(sig) = parse_signal_name(name) {
                *self = if remove {
                    std::mem::take(self).without_signal(sig)
                } else {
                    std::mem::take(self).with_signal(sig)
                };
            }
        }
    }

    /// The effective fatal-signal list, defaults first, without duplicates.
    /// Catchability is not checked here: `SIGKILL`/`SIGSTOP` are rejected
    /// at install time.
    #[must_use]
    pub fn fatal_signal_list(&self) -> Vec<i32> {
        let mut out: Vec<i32> = DEFAULT_FATAL_SIGNALS
            .iter()
            .chain(self.extra_signals.iter())
            .copied()
            .filter(|s| !self.removed_signals.contains(s))
            .collect();
        let mut seen = Vec::with_capacity(out.len());
        out.retain(|s| {
            if seen.contains(s) {
                false
            } else {
                seen.push(*s);
                true
            }
        });
        out
    }
}

const SIGNAL_NAMES: &[(&str, i32)] = &[
    ("HUP", libc::SIGHUP),
    ("INT", libc::SIGINT),
    ("QUIT", libc::SIGQUIT),
    ("ILL", libc::SIGILL),
    ("TRAP", libc::SIGTRAP),
    ("ABRT", libc::SIGABRT),
    ("BUS", libc::SIGBUS),
    ("FPE", libc::SIGFPE),
    ("USR1", libc::SIGUSR1),
    ("SEGV", libc::SIGSEGV),
    ("USR2", libc::SIGUSR2),
    ("PIPE", libc::SIGPIPE),
    ("ALRM", libc::SIGALRM),
    ("TERM", libc::SIGTERM),
    ("XCPU", libc::SIGXCPU),
    ("XFSZ", libc::SIGXFSZ),
    ("VTALRM", libc::SIGVTALRM),
    ("PROF", libc::SIGPROF),
    ("SYS", libc::SIGSYS),
];

/// Parse `SIGTERM`, `TERM`, `term` or `15`.
#[must_use]
pub fn parse_signal_name(raw: &str) -> Option<i32> {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<i32>() {
        return (n > 0).then_some(n);
    }
    let upper = raw.to_ascii_uppercase();
    let name = upper.strip_prefix("SIG").unwrap_or(&upper);
    SIGNAL_NAMES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|&(_, sig)| sig)
}

/// Human-readable name for `sig`, e.g. `SIGTERM`.
#[must_use]
pub fn signal_name(sig: i32) -> String {
    SIGNAL_NAMES
        .iter()
        .find(|&&(_, s)| s == sig)
        .map_or_else(|| format!("SIG{sig}"), |(n, _)| format!("SIG{n}"))
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Install `config` for this process.
///
/// Must run before the first registry operation.
pub fn configure(config: Config) -> Result<()> {
    CONFIG.set(config).map_err(|_| Error::AlreadyConfigured)
}

/// The frozen configuration, resolving it from the environment if nobody
/// called [`configure`].
pub fn active() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_signal_names() {
        assert_eq!(parse_signal_name("SIGTERM"), Some(libc::SIGTERM));
        assert_eq!(parse_signal_name("term"), Some(libc::SIGTERM));
        assert_eq!(parse_signal_name(" segv "), Some(libc::SIGSEGV));
        assert_eq!(parse_signal_name("2"), Some(libc::SIGINT));
        assert_eq!(parse_signal_name("0"), None);
        assert_eq!(parse_signal_name("bogus"), None);
    }

    #[test]
    fn signal_name_roundtrip() {
        assert_eq!(signal_name(libc::SIGINT), "SIGINT");
        assert_eq!(signal_name(200), "SIG200");
    }

    #[test]
    fn default_list_matches_constant() {
        assert_eq!(Config::default().fatal_signal_list(), DEFAULT_FATAL_SIGNALS);
    }

    #[test]
    fn signal_spec_adds_and_removes() {
        let mut cfg = Config::default();
        cfg.apply_signal_spec("SEGV, -PIPE, +usr1, nonsense, ,INT");
        let list = cfg.fatal_signal_list();
        assert!(list.contains(&libc::SIGSEGV));
        assert!(list.contains(&libc::SIGUSR1));
        assert!(!list.contains(&libc::SIGPIPE));
        assert_eq!(list.iter().filter(|&&s| s == libc::SIGINT).count(), 1);
    }

    #[test]
    fn later_spec_entries_win() {
        let cfg = Config::default()
            .without_signal(libc::SIGHUP)
            .with_signal(libc::SIGHUP);
        assert!(cfg.fatal_signal_list().contains(&libc::SIGHUP));
        let cfg = cfg.without_signal(libc::SIGHUP);
        assert!(!cfg.fatal_signal_list().contains(&libc::SIGHUP));
    }

    #[test]
    fn log_sink_parsing() {
        assert_eq!(LogSink::from_str_loose("stderr"), LogSink::Stderr);
        assert_eq!(LogSink::from_str_loose(""), LogSink::Stderr);
        assert_eq!(LogSink::from_str_loose("OFF"), LogSink::Off);
        assert_eq!(
            LogSink::from_str_loose("/var/log/tmpguard.jsonl"),
            LogSink::File(PathBuf::from("/var/log/tmpguard.jsonl"))
        );
    }
}
