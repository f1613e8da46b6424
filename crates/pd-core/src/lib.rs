//! Shared primitives used across PixelDust crates.

use chrono::DateTime;
use chrono::Utc;
use core::fmt;

/// Result alias used across the workspace.
pub type BrowserResult<T> = Result<T, BrowserError>;

/// Wall-clock instant used for certificate validity windows.
pub type Timestamp = DateTime<Utc>;

/// Workspace error: a stable dotted `code` plus a human readable message.
///
/// The first segment of the code names the subsystem that raised it
/// (`trust`, `storage`, `net`, `config`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserError {
    pub code: &'static str,
    pub message: String,
}

impl BrowserError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Subsystem prefix of the error code, e.g. `storage` for `storage.record_write_failed`.
    pub fn subsystem(&self) -> &'static str {
        match self.code.split_once('.') {
            Some((head, _)) => head,
            None => self.code,
        }
    }

    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }

    /// Prefixes the message with caller context while keeping the code stable.
    pub fn context(mut self, context: impl fmt::Display) -> Self {
        self.message = format!("{context}: {}", self.message);
        self
    }

    pub fn lock_poisoned(what: &str) -> Self {
        Self::new(
            "trust.tab_lock_poisoned",
            format!("{what} lock was poisoned by a panicking thread"),
        )
    }
}

impl fmt::Display for BrowserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for BrowserError {}
