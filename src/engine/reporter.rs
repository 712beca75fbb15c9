//! Log collection for update responses.
//!
//! Entries accumulate between responses and are drained into the next
//! [`UpdateResponse`](crate::protocol::UpdateResponse). Every entry is also
//! mirrored to the `log` facade so it shows up in the process's own output.

use std::sync::{Mutex, PoisonError};

use crate::protocol::{LogEntry, MessageSeverity, ResponseLoggingLevel};

/// Thread-safe collector of agent log entries.
#[derive(Debug, Default)]
pub struct Reporter {
    entries: Mutex<Vec<LogEntry>>,
}

impl Reporter {
    /// Create an empty reporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entry.
    pub fn report(&self, severity: MessageSeverity, message: impl Into<String>) {
        let message = message.into();
        match severity {
            MessageSeverity::Verbose => log::debug!("[Agent] {message}"),
            MessageSeverity::Warning => log::warn!("[Agent] {message}"),
            MessageSeverity::Error => log::error!("[Agent] {message}"),
        }
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LogEntry { severity, message });
    }

    /// Record a verbose entry.
    pub fn verbose(&self, message: impl Into<String>) {
        self.report(MessageSeverity::Verbose, message);
    }

    /// Record a warning.
    pub fn warning(&self, message: impl Into<String>) {
        self.report(MessageSeverity::Warning, message);
    }

    /// Record an error.
    pub fn error(&self, message: impl Into<String>) {
        self.report(MessageSeverity::Error, message);
    }

    /// Drain collected entries, keeping only those `level` asks for.
    pub fn take_entries(&self, level: ResponseLoggingLevel) -> Vec<LogEntry> {
        let drained = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *entries)
        };
        match level {
            ResponseLoggingLevel::Verbose => drained,
            ResponseLoggingLevel::WarningsAndErrors => drained
                .into_iter()
                .filter(|entry| entry.severity != MessageSeverity::Verbose)
                .collect(),
        }
    }
}
