//! Append-only audit log of state mutations.
//!
//! Every successful store mutation appends exactly one event here,
//! after the state write commits. The log is the forensic source of
//! truth for reconstructing what happened to a record; append order is
//! authoritative.
//!
//! # File Format
//!
//! One self-describing JSON event per line:
//!
//! ```json
//! {"event_id":"9f2c4a1d","timestamp":"2026-02-01T09:30:00Z","event_type":"marked_paid","client":"acme","invoice_id":"INV-100","payload":{"amount_cents":150000}}
//! ```
//!
//! # Invariants
//!
//! - [INV-AUD-001] Events are only ever appended; nothing rewrites or
//!   deletes an existing line.
//! - [INV-AUD-002] Replay skips malformed lines (logging each skip)
//!   instead of failing the whole replay; a torn final line must not
//!   make the history unreadable.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// File name of the audit log inside the state directory.
pub const AUDIT_LOG_FILENAME: &str = "events.log";

/// Length of the short event id (a truncated UUID).
pub const EVENT_ID_LEN: usize = 8;

/// Event type identifiers recorded by the core.
pub mod event_types {
    /// A record was created or rewritten through the plain write path.
    pub const RECORD_WRITTEN: &str = "record_written";
    /// A parsed invoice was routed into the store.
    pub const INVOICE_ROUTED: &str = "invoice_routed";
    /// A payment was recorded and the record archived.
    pub const MARKED_PAID: &str = "marked_paid";
    /// A record was escalated by supervisor judgment.
    pub const ESCALATED: &str = "escalated";
    /// A held record was promoted to unpaid.
    pub const HELD_PROMOTED: &str = "held_promoted";
    /// A held record was rejected into the archive.
    pub const HELD_REJECTED: &str = "held_rejected";
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Errors from audit log operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuditError {
    /// I/O failure on the log file.
    #[error("audit I/O error on {path}: {source}")]
    Io {
        /// Path the operation touched.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Event serialization failed.
    #[error("audit event serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One audited state mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditEvent {
    /// Short unique id for cross-referencing.
    pub event_id: String,
    /// When the event was appended.
    pub timestamp: DateTime<Utc>,
    /// One of [`event_types`].
    pub event_type: String,
    /// Client of the affected record.
    pub client: String,
    /// Invoice id of the affected record.
    pub invoice_id: String,
    /// Event-specific snapshot of what changed.
    pub payload: serde_json::Value,
}

impl AuditEvent {
    /// Create an event stamped with the current time and a fresh id.
    #[must_use]
    pub fn new(
        event_type: &str,
        client: &str,
        invoice_id: &str,
        payload: serde_json::Value,
    ) -> Self {
        let mut event_id = Uuid::new_v4().simple().to_string();
        event_id.truncate(EVENT_ID_LEN);
        Self {
            event_id,
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            client: client.to_string(),
            invoice_id: invoice_id.to_string(),
            payload,
        }
    }
}

/// Handle to an append-only JSONL audit log.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// Create a handle; the file itself is created on first append.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the underlying log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event and flush it to disk.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] if serialization or the append fails.
    pub fn append(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| self.io_error(e))?;
        file.sync_all().map_err(|e| self.io_error(e))?;

        debug!(
            event_type = %event.event_type,
            client = %event.client,
            invoice_id = %event.invoice_id,
            "audit event appended"
        );
        Ok(())
    }

    /// Replay events in append order, optionally only those at or after
    /// `since`. Malformed lines are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Io`] if the log cannot be read. A missing
    /// log replays as empty.
    pub fn replay(&self, since: Option<DateTime<Utc>>) -> Result<Vec<AuditEvent>, AuditError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        let mut events = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEvent>(line) {
                Ok(event) => {
                    if since.is_none_or(|cutoff| event.timestamp >= cutoff) {
                        events.push(event);
                    }
                },
                Err(e) => {
                    warn!(line = index + 1, error = %e, "skipping malformed audit line");
                },
            }
        }
        Ok(events)
    }

    /// Number of events currently in the log (malformed lines
    /// included; they still occupy an append slot).
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Io`] if the log cannot be read.
    pub fn event_count(&self) -> Result<usize, AuditError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(self.io_error(e)),
        };
        Ok(content.lines().filter(|line| !line.trim().is_empty()).count())
    }

    fn io_error(&self, source: std::io::Error) -> AuditError {
        AuditError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
