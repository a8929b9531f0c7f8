//! File-backed message queues between the suite's processes.
//!
//! Each consumer owns one append-only JSONL log plus a cursor file
//! holding how many lines it has processed. Producers append; the
//! consumer reads everything past its cursor and commits a new offset
//! once the batch is handled. Offsets are raw line counts, so a
//! malformed line still advances the cursor and can never wedge the
//! queue.
//!
//! Producers also keep a dedupe marker per `(kind, client, invoice)`
//! so a retried upstream event is not enqueued twice within the
//! dedupe window.
//!
//! # File Format
//!
//! `<queue_dir>/<consumer>.log`, one message per line:
//!
//! ```json
//! {"schema":"dunning.queue_message.v1","message_id":"1b9d6bcd-...","kind":"payment_received","client":"acme","invoice_id":"INV-100","queued_at":"2026-02-01T09:30:00Z","payload":{"amount_cents":150000}}
//! ```
//!
//! `<queue_dir>/<consumer>.cursor` holds the committed offset as a
//! decimal line count. Dedupe markers live under `<queue_dir>/dedupe/`
//! named by a digest of the message key, each containing the RFC 3339
//! time it was last sent.
//!
//! # Invariants
//!
//! - [INV-QUE-001] Commit offsets only move forward, and never past
//!   the end of the log.
//! - [INV-QUE-002] An uncommitted batch is redelivered in full on the
//!   next read; delivery is at-least-once.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::record::hex_encode;
use crate::store::is_safe_component;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Schema identifier embedded in every queue message.
pub const QUEUE_MESSAGE_SCHEMA: &str = "dunning.queue_message.v1";

/// Maximum serialized size of one message.
pub const MAX_QUEUE_MESSAGE_SIZE: usize = 16 * 1024;

/// Subdirectory of the queue dir holding producer dedupe markers.
pub const DEDUPE_DIR_NAME: &str = "dedupe";

/// Length of a dedupe marker file name.
const DEDUPE_KEY_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Errors from queue operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// I/O failure.
    #[error("queue I/O error on {path}: {source}")]
    Io {
        /// Path the operation touched.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Message serialization failed.
    #[error("queue message serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Serialized message exceeds [`MAX_QUEUE_MESSAGE_SIZE`].
    #[error("queue message of {size} bytes exceeds the {limit}-byte limit")]
    MessageTooLarge {
        /// Serialized size.
        size: usize,
        /// The enforced limit.
        limit: usize,
    },

    /// Consumer name failed validation.
    #[error("invalid consumer name {name:?}")]
    InvalidConsumer {
        /// The rejected name.
        name: String,
    },

    /// Commit offset is behind the cursor or past the end of the log.
    #[error("cannot commit offset {offset}: committed {committed}, log has {total} lines")]
    InvalidOffset {
        /// Offset that was requested.
        offset: u64,
        /// Offset currently committed.
        committed: u64,
        /// Lines currently in the log.
        total: u64,
    },

    /// Cursor file content is not a decimal offset.
    #[error("cursor file {path} is corrupt: {content:?}")]
    InvalidCursor {
        /// Path of the cursor file.
        path: String,
        /// The unparseable content.
        content: String,
    },
}

/// One message on a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueMessage {
    /// Always [`QUEUE_MESSAGE_SCHEMA`].
    pub schema: String,
    /// Unique id of this send.
    pub message_id: String,
    /// What happened, e.g. `payment_received`.
    pub kind: String,
    /// Client of the affected invoice.
    pub client: String,
    /// Invoice the message concerns.
    pub invoice_id: String,
    /// When the message was enqueued.
    pub queued_at: DateTime<Utc>,
    /// Kind-specific details.
    pub payload: serde_json::Value,
}

impl QueueMessage {
    /// Create a message stamped with the current time and a fresh id.
    #[must_use]
    pub fn new(kind: &str, client: &str, invoice_id: &str, payload: serde_json::Value) -> Self {
        Self {
            schema: QUEUE_MESSAGE_SCHEMA.to_string(),
            message_id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            client: client.to_string(),
            invoice_id: invoice_id.to_string(),
            queued_at: Utc::now(),
            payload,
        }
    }

    /// Digest identifying this message for producer-side dedupe.
    /// Deliberately excludes `message_id` and `queued_at` so a retry
    /// of the same upstream event maps to the same key.
    #[must_use]
    pub fn dedupe_key(&self) -> String {
        let input = format!("{}:{}:{}", self.kind, self.client, self.invoice_id);
        let digest = Sha256::digest(input.as_bytes());
        let mut hex = hex_encode(&digest);
        hex.truncate(DEDUPE_KEY_LEN);
        hex
    }
}

/// Messages past the consumer's cursor, plus the offset to commit
/// after handling them.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingBatch {
    /// Undelivered messages in append order.
    pub messages: Vec<QueueMessage>,
    /// Offset covering the whole batch.
    pub end_offset: u64,
}

/// One consumer's queue.
#[derive(Debug, Clone)]
pub struct MessageQueue {
    dir: PathBuf,
    consumer: String,
    dedupe_window: Duration,
}

impl MessageQueue {
    /// Open (creating if needed) the queue for `consumer`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidConsumer`] for unsafe names, or
    /// [`QueueError::Io`] if the directories cannot be created.
    pub fn open(
        dir: impl Into<PathBuf>,
        consumer: &str,
        dedupe_window: Duration,
    ) -> Result<Self, QueueError> {
        if !is_safe_component(consumer) {
            return Err(QueueError::InvalidConsumer {
                name: consumer.to_string(),
            });
        }
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        let dedupe_dir = dir.join(DEDUPE_DIR_NAME);
        std::fs::create_dir_all(&dedupe_dir).map_err(|e| io_error(&dedupe_dir, e))?;
        Ok(Self {
            dir,
            consumer: consumer.to_string(),
            dedupe_window,
        })
    }

    /// Name of the consumer this queue belongs to.
    #[must_use]
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.consumer))
    }

    fn cursor_path(&self) -> PathBuf {
        self.dir.join(format!("{}.cursor", self.consumer))
    }

    fn marker_path(&self, message: &QueueMessage) -> PathBuf {
        self.dir.join(DEDUPE_DIR_NAME).join(message.dedupe_key())
    }

    /// Append a message unless an identical send is still within the
    /// dedupe window. Returns whether the message was enqueued.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] on serialization, size, or I/O failures.
    pub fn send(&self, message: &QueueMessage) -> Result<bool, QueueError> {
        let marker = self.marker_path(message);
        if self.marker_is_fresh(&marker)? {
            debug!(
                consumer = %self.consumer,
                kind = %message.kind,
                client = %message.client,
                invoice_id = %message.invoice_id,
                "duplicate send suppressed"
            );
            return Ok(false);
        }

        let mut line = serde_json::to_string(message)?;
        if line.len() > MAX_QUEUE_MESSAGE_SIZE {
            return Err(QueueError::MessageTooLarge {
                size: line.len(),
                limit: MAX_QUEUE_MESSAGE_SIZE,
            });
        }
        line.push('\n');

        let log_path = self.log_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| io_error(&log_path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| io_error(&log_path, e))?;
        file.sync_all().map_err(|e| io_error(&log_path, e))?;

        std::fs::write(&marker, Utc::now().to_rfc3339()).map_err(|e| io_error(&marker, e))?;
        self.prune_stale_markers()?;

        debug!(
            consumer = %self.consumer,
            kind = %message.kind,
            invoice_id = %message.invoice_id,
            "message queued"
        );
        Ok(true)
    }

    /// Whether a dedupe marker exists and is younger than the window.
    /// Unreadable or unparseable markers count as absent.
    fn marker_is_fresh(&self, marker: &Path) -> Result<bool, QueueError> {
        let content = match std::fs::read_to_string(marker) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(io_error(marker, e)),
        };
        let Ok(sent_at) = DateTime::parse_from_rfc3339(content.trim()) else {
            return Ok(false);
        };
        let age = Utc::now().signed_duration_since(sent_at.with_timezone(&Utc));
        let window =
            chrono::Duration::from_std(self.dedupe_window).unwrap_or(chrono::Duration::MAX);
        Ok(age <= window)
    }

    fn prune_stale_markers(&self) -> Result<(), QueueError> {
        let dedupe_dir = self.dir.join(DEDUPE_DIR_NAME);
        let entries = match std::fs::read_dir(&dedupe_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_error(&dedupe_dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&dedupe_dir, e))?;
            let path = entry.path();
            if !self.marker_is_fresh(&path)? {
                match std::fs::remove_file(&path) {
                    Ok(()) => {},
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                    Err(e) => return Err(io_error(&path, e)),
                }
            }
        }
        Ok(())
    }

    /// Everything past the consumer's cursor.
    ///
    /// Malformed lines are skipped with a warning but still counted in
    /// the returned offset, so committing the batch moves past them.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the log or cursor cannot be read.
    pub fn pending(&self) -> Result<PendingBatch, QueueError> {
        let committed = self.committed_offset()?;
        let log_path = self.log_path();
        let content = match std::fs::read_to_string(&log_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(io_error(&log_path, e)),
        };

        let mut messages = Vec::new();
        let mut total = 0_u64;
        for (index, line) in content.lines().enumerate() {
            total += 1;
            if (index as u64) < committed {
                continue;
            }
            match serde_json::from_str::<QueueMessage>(line) {
                Ok(message) if message.schema == QUEUE_MESSAGE_SCHEMA => messages.push(message),
                Ok(message) => {
                    warn!(
                        consumer = %self.consumer,
                        line = index + 1,
                        schema = %message.schema,
                        "skipping message with unknown schema"
                    );
                },
                Err(e) => {
                    warn!(
                        consumer = %self.consumer,
                        line = index + 1,
                        error = %e,
                        "skipping malformed queue line"
                    );
                },
            }
        }
        Ok(PendingBatch {
            messages,
            end_offset: total,
        })
    }

    /// Advance the cursor to `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidOffset`] if `offset` is behind the
    /// committed cursor or past the end of the log.
    pub fn commit(&self, offset: u64) -> Result<(), QueueError> {
        let committed = self.committed_offset()?;
        let total = self.total_lines()?;
        if offset < committed || offset > total {
            return Err(QueueError::InvalidOffset {
                offset,
                committed,
                total,
            });
        }

        let cursor_path = self.cursor_path();
        let mut temp =
            tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| io_error(&self.dir, e))?;
        temp.as_file_mut()
            .write_all(offset.to_string().as_bytes())
            .map_err(|e| io_error(temp.path(), e))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| io_error(temp.path(), e))?;
        temp.persist(&cursor_path)
            .map_err(|e| io_error(&cursor_path, e.error))?;

        debug!(consumer = %self.consumer, offset, "cursor committed");
        Ok(())
    }

    /// Number of uncommitted messages.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the log or cursor cannot be read.
    pub fn depth(&self) -> Result<u64, QueueError> {
        let committed = self.committed_offset()?;
        let total = self.total_lines()?;
        Ok(total.saturating_sub(committed))
    }

    fn committed_offset(&self) -> Result<u64, QueueError> {
        let cursor_path = self.cursor_path();
        let content = match std::fs::read_to_string(&cursor_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_error(&cursor_path, e)),
        };
        content
            .trim()
            .parse()
            .map_err(|_| QueueError::InvalidCursor {
                path: cursor_path.display().to_string(),
                content: content.trim().to_string(),
            })
    }

    fn total_lines(&self) -> Result<u64, QueueError> {
        let log_path = self.log_path();
        let content = match std::fs::read_to_string(&log_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_error(&log_path, e)),
        };
        Ok(content.lines().count() as u64)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> QueueError {
    QueueError::Io {
        path: path.display().to_string(),
        source,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
