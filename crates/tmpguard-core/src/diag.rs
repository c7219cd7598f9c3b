//! Structured diagnostics for explicit cleanup paths.
//!
//! Records are single JSONL lines:
//! `{"timestamp":..,"level":"warn","event":"remove_file_failed","path":..,"errno":13}`.
//!
//! Nothing in this module is async-signal-safe (it allocates and takes the
//! sink lock). The fatal-signal handler never calls it.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{self, LogSink};
use crate::error::Error;

/// Severity level for diagnostic records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// One diagnostic line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagRecord {
    pub timestamp: String,
    pub level: Level,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl DiagRecord {
    #[must_use]
    pub fn new(level: Level, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            level,
            event: event.into(),
            path: None,
            errno: None,
            message: None,
            details: None,
        }
    }

    /// Build a warning from a registry error.
    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        let mut record = Self::new(Level::Warn, err.event_name()).with_message(err.to_string());
        record.errno = err.raw_os_error();
        record.path = match err {
            Error::RemoveFile { path, .. }
            | Error::RemoveDir { path, .. }
            | Error::Open { path, .. }
            | Error::InvalidPath { path, .. } => Some(path.display().to_string()),
            Error::CreateDir { template, .. } => Some(template.display().to_string()),
            _ => None,
        };
        record
    }

    #[must_use]
    pub fn with_path(mut self, path: &Path) -> Self {
        self.path = Some(path.display().to_string());
        self
    }

    #[must_use]
    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = Some(errno);
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize as one JSON line (no trailing newline).
    pub fn to_jsonl(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Serializes writers so concurrent records never interleave.
static SINK_LOCK: Mutex<()> = Mutex::new(());

/// Write `record` to the configured sink. Failures are dropped: a cleanup
/// routine has nowhere better to report a broken log.
pub fn emit(record: &DiagRecord) {
    emit_to(&config::active().log_sink, record);
}

/// Write `record` to an explicit sink.
pub fn emit_to(sink: &LogSink, record: &DiagRecord) {
    let Ok(line) = record.to_jsonl() else {
        return;
    };
    let _guard = SINK_LOCK.lock();
    match sink {
        LogSink::Off => {}
        LogSink::Stderr => {
            let _ = writeln!(std::io::stderr().lock(), "{line}");
        }
        LogSink::File(path) => {
            if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
                let _ = writeln!(file, "{line}");
            }
        }
    }
}

/// Report `err` if `verbose`; always hand it back for propagation.
pub fn report(err: Error, verbose: bool) -> Error {
    if verbose {
        emit(&DiagRecord::from_error(&err));
    }
    err
}

fn now_utc() -> String {
    // Calendar conversion without a date crate (civil-from-days).
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();
    let days = (secs / 86_400) as i64;
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{millis:03}Z",
        (secs % 86_400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
    )
}
