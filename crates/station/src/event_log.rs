//! Append-only station log file: one line per cycle timestamp, per publish
//! and per error.  This is what is left to read after the station has been
//! running unattended for weeks.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use crate::error::StorageError;

pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, line: &str) -> Result<(), StorageError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{line}"))
            .map_err(|source| StorageError::Write {
                path: self.path.clone(),
                source,
            })
    }

    /// Append, logging instead of failing.  Used on paths that are already
    /// handling an error.
    pub fn note(&self, line: &str) {
        if let Err(e) = self.append(line) {
            tracing::error!("event log: {e}");
        }
    }

    pub fn error(&self, detail: &dyn std::fmt::Display) {
        self.note(&format!("Error: {detail}"));
    }
}
