//! Store implementation: paths, bounded reads, atomic writes, and the
//! compound payment/archive operations.

use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit::{AUDIT_LOG_FILENAME, AuditError, AuditEvent, AuditLog, event_types};
use crate::record::{InvoiceRecord, InvoiceStatus, PaymentInfo, RecordError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Subdirectory of the state dir holding archived records.
pub const ARCHIVE_DIR_NAME: &str = "archive";

/// Maximum size of a record file accepted by reads.
pub const MAX_RECORD_FILE_SIZE: u64 = 64 * 1024;

/// Maximum length of a client or invoice identifier.
pub const MAX_IDENTIFIER_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// I/O failure.
    #[error("store I/O error on {path}: {source}")]
    Io {
        /// Path the operation touched.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Stored checksum does not match the recomputed one.
    #[error(
        "record {client}/{invoice_id} is corrupt: stored checksum {stored}, computed {computed}"
    )]
    Corruption {
        /// Client of the corrupt record.
        client: String,
        /// Invoice id of the corrupt record.
        invoice_id: String,
        /// Checksum embedded in the file.
        stored: String,
        /// Checksum recomputed from the content.
        computed: String,
    },

    /// The requested status change is not in the transition table.
    #[error("record {client}/{invoice_id} cannot transition from {from} to {to}")]
    InvalidTransition {
        /// Client of the record.
        client: String,
        /// Invoice id of the record.
        invoice_id: String,
        /// Status currently on disk.
        from: InvoiceStatus,
        /// Status that was requested.
        to: InvoiceStatus,
    },

    /// No active or archived record for the identifiers.
    #[error("no record for {client}/{invoice_id}")]
    NotFound {
        /// Client that was looked up.
        client: String,
        /// Invoice id that was looked up.
        invoice_id: String,
    },

    /// Identifier failed validation and never reached a path.
    #[error("invalid identifier {value:?}")]
    InvalidIdentifier {
        /// The rejected value.
        value: String,
    },

    /// Record file exceeds [`MAX_RECORD_FILE_SIZE`].
    #[error("record file {path} exceeds the {limit}-byte limit")]
    Oversized {
        /// Path of the oversized file.
        path: String,
        /// The enforced limit.
        limit: u64,
    },

    /// Path is a symlink; the store refuses to follow it.
    #[error("refusing symlink at {path}")]
    SymlinkRefused {
        /// The offending path.
        path: String,
    },

    /// Path exists but is not a regular file.
    #[error("{path} is not a regular file")]
    NotRegularFile {
        /// The offending path.
        path: String,
    },

    /// Operation requires a held record but the status is not held.
    #[error("record {client}/{invoice_id} is {status}, not held for review")]
    NotHeld {
        /// Client of the record.
        client: String,
        /// Invoice id of the record.
        invoice_id: String,
        /// Status actually on disk.
        status: InvoiceStatus,
    },

    /// Record-level failure (checksum computation, serialization).
    #[error(transparent)]
    Record(#[from] RecordError),

    /// File content is not a valid record document.
    #[error("failed to parse record {path}: {source}")]
    Parse {
        /// Path of the unparseable file.
        path: String,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// Audit log append or replay failed.
    #[error(transparent)]
    Audit(#[from] AuditError),
}

// ---------------------------------------------------------------------------
// Identifier validation
// ---------------------------------------------------------------------------

/// Whether a value is safe to use as a single path component.
///
/// Accepts ASCII alphanumerics plus `.`, `_`, `-`, up to
/// [`MAX_IDENTIFIER_LEN`] bytes, not starting with a dot, and not the
/// reserved archive directory name.
pub(crate) fn is_safe_component(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_IDENTIFIER_LEN
        && !value.starts_with('.')
        && value != ARCHIVE_DIR_NAME
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn validate_identifier(value: &str) -> Result<(), StoreError> {
    if is_safe_component(value) {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier {
            value: value.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Filesystem-backed store of invoice records.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
    audit: AuditLog,
}

impl StateStore {
    /// Open (creating if needed) the store rooted at `root`.
    ///
    /// Creates the root and archive directories, then sweeps temp
    /// files left behind by interrupted writes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directories cannot be
    /// created or the sweep fails.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| io_error(&root, e))?;
        let archive = root.join(ARCHIVE_DIR_NAME);
        std::fs::create_dir_all(&archive).map_err(|e| io_error(&archive, e))?;

        let audit = AuditLog::new(root.join(AUDIT_LOG_FILENAME));
        let store = Self { root, audit };
        let swept = store.sweep_temp_files()?;
        if swept > 0 {
            warn!(swept, root = %store.root.display(), "removed temp files from interrupted writes");
        }
        Ok(store)
    }

    /// Root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The audit log every mutation appends to.
    #[must_use]
    pub const fn audit(&self) -> &AuditLog {
        &self.audit
    }

    fn record_path(&self, client: &str, invoice_id: &str) -> PathBuf {
        self.root.join(client).join(format!("{invoice_id}.json"))
    }

    fn archived_record_path(&self, client: &str, invoice_id: &str) -> PathBuf {
        self.root
            .join(ARCHIVE_DIR_NAME)
            .join(client)
            .join(format!("{invoice_id}.json"))
    }

    /// Persist a record, sealing it and auditing a `record_written`
    /// event.
    ///
    /// If the record already exists on disk, the status change must be
    /// allowed by the transition table. Returns the sealed record as
    /// written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on identifier, transition, checksum, or
    /// I/O failures.
    pub fn write(&self, record: InvoiceRecord) -> Result<InvoiceRecord, StoreError> {
        let payload = json!({
            "status": record.status,
            "amount_cents": record.amount_cents,
        });
        self.write_with_event(record, event_types::RECORD_WRITTEN, payload)
    }

    /// Persist a record with a caller-chosen audit event.
    ///
    /// The audit event is appended only after the state write commits.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on identifier, transition, checksum, or
    /// I/O failures.
    pub fn write_with_event(
        &self,
        mut record: InvoiceRecord,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<InvoiceRecord, StoreError> {
        validate_identifier(&record.client)?;
        validate_identifier(&record.invoice_id)?;

        if let Some(previous) = self.read(&record.client, &record.invoice_id)? {
            if !previous.status.can_transition_to(record.status) {
                return Err(StoreError::InvalidTransition {
                    client: record.client,
                    invoice_id: record.invoice_id,
                    from: previous.status,
                    to: record.status,
                });
            }
        }

        record.seal()?;
        let bytes = serde_json::to_vec_pretty(&record).map_err(RecordError::Serialize)?;

        let client_dir = self.root.join(&record.client);
        std::fs::create_dir_all(&client_dir).map_err(|e| io_error(&client_dir, e))?;
        let path = self.record_path(&record.client, &record.invoice_id);
        atomic_write(&client_dir, &path, &bytes)?;

        info!(
            client = %record.client,
            invoice_id = %record.invoice_id,
            status = %record.status,
            "record written"
        );
        self.audit.append(&AuditEvent::new(
            event_type,
            &record.client,
            &record.invoice_id,
            payload,
        ))?;
        Ok(record)
    }

    /// Read an active record, verifying its checksum.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corruption`] if the checksum does not
    /// match, or other variants on read failures. A missing record is
    /// `Ok(None)`.
    pub fn read(&self, client: &str, invoice_id: &str) -> Result<Option<InvoiceRecord>, StoreError> {
        validate_identifier(client)?;
        validate_identifier(invoice_id)?;
        self.read_path(&self.record_path(client, invoice_id))
    }

    /// Read an archived record, verifying its checksum.
    ///
    /// # Errors
    ///
    /// Same contract as [`StateStore::read`].
    pub fn read_archived(
        &self,
        client: &str,
        invoice_id: &str,
    ) -> Result<Option<InvoiceRecord>, StoreError> {
        validate_identifier(client)?;
        validate_identifier(invoice_id)?;
        self.read_path(&self.archived_record_path(client, invoice_id))
    }

    fn read_path(&self, path: &Path) -> Result<Option<InvoiceRecord>, StoreError> {
        let Some(bytes) = read_bounded(path)? else {
            return Ok(None);
        };
        let record: InvoiceRecord =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        let computed = record.compute_checksum()?;
        if record.checksum != computed {
            return Err(StoreError::Corruption {
                client: record.client,
                invoice_id: record.invoice_id,
                stored: record.checksum,
                computed,
            });
        }
        Ok(Some(record))
    }

    /// Record a payment and archive the record.
    ///
    /// The sequence is crash-safe: the paid record is first committed
    /// in place, then copied to the archive, then the active file is
    /// removed. A retry after a crash at any point converges to the
    /// archived paid record, and retrying after completion is an
    /// idempotent success.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the record does not exist
    /// anywhere, [`StoreError::InvalidTransition`] if the active
    /// record cannot move to paid, or other variants on I/O failures.
    pub fn mark_paid(
        &self,
        client: &str,
        invoice_id: &str,
        payment: PaymentInfo,
    ) -> Result<InvoiceRecord, StoreError> {
        validate_identifier(client)?;
        validate_identifier(invoice_id)?;

        let Some(mut record) = self.read(client, invoice_id)? else {
            if let Some(archived) = self.read_archived(client, invoice_id)? {
                if archived.status == InvoiceStatus::Paid {
                    debug!(client, invoice_id, "already archived as paid");
                    return Ok(archived);
                }
            }
            return Err(StoreError::NotFound {
                client: client.to_string(),
                invoice_id: invoice_id.to_string(),
            });
        };

        if !record.status.can_transition_to(InvoiceStatus::Paid) {
            return Err(StoreError::InvalidTransition {
                client: client.to_string(),
                invoice_id: invoice_id.to_string(),
                from: record.status,
                to: InvoiceStatus::Paid,
            });
        }

        let amount_cents = payment.amount_cents;
        let method = payment.method.clone();
        record.status = InvoiceStatus::Paid;
        record.payment = Some(payment);
        record.seal()?;
        let bytes = serde_json::to_vec_pretty(&record).map_err(RecordError::Serialize)?;

        // Commit the paid state in place first so a crash before the
        // archive copy still leaves a consistent record.
        let client_dir = self.root.join(client);
        std::fs::create_dir_all(&client_dir).map_err(|e| io_error(&client_dir, e))?;
        let active_path = self.record_path(client, invoice_id);
        atomic_write(&client_dir, &active_path, &bytes)?;

        let archive_dir = self.root.join(ARCHIVE_DIR_NAME).join(client);
        std::fs::create_dir_all(&archive_dir).map_err(|e| io_error(&archive_dir, e))?;
        let archive_path = self.archived_record_path(client, invoice_id);
        atomic_write(&archive_dir, &archive_path, &bytes)?;

        match std::fs::remove_file(&active_path) {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(io_error(&active_path, e)),
        }

        info!(client, invoice_id, amount_cents, "payment recorded and archived");
        self.audit.append(&AuditEvent::new(
            event_types::MARKED_PAID,
            client,
            invoice_id,
            json!({"amount_cents": amount_cents, "method": method}),
        ))?;
        Ok(record)
    }

    /// Escalate a record, auditing the reason.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no active record exists, or
    /// [`StoreError::InvalidTransition`] if the current status cannot
    /// escalate.
    pub fn escalate(
        &self,
        client: &str,
        invoice_id: &str,
        reason: &str,
    ) -> Result<InvoiceRecord, StoreError> {
        let mut record = self.read(client, invoice_id)?.ok_or_else(|| StoreError::NotFound {
            client: client.to_string(),
            invoice_id: invoice_id.to_string(),
        })?;
        record.status = InvoiceStatus::Escalated;
        self.write_with_event(record, event_types::ESCALATED, json!({"reason": reason}))
    }

    /// Promote a held record to unpaid after operator review.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotHeld`] if the record is not in a held
    /// status, or [`StoreError::NotFound`] if it does not exist.
    pub fn promote(&self, client: &str, invoice_id: &str) -> Result<InvoiceRecord, StoreError> {
        let mut record = self.read(client, invoice_id)?.ok_or_else(|| StoreError::NotFound {
            client: client.to_string(),
            invoice_id: invoice_id.to_string(),
        })?;
        if !record.status.is_held() {
            return Err(StoreError::NotHeld {
                client: client.to_string(),
                invoice_id: invoice_id.to_string(),
                status: record.status,
            });
        }
        let previous = record.status;
        record.status = InvoiceStatus::Unpaid;
        self.write_with_event(
            record,
            event_types::HELD_PROMOTED,
            json!({"previous_status": previous}),
        )
    }

    /// Reject a held record: archive it unchanged and remove it from
    /// the active set.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotHeld`] if the record is not in a held
    /// status, or [`StoreError::NotFound`] if it does not exist.
    pub fn reject(
        &self,
        client: &str,
        invoice_id: &str,
        reason: &str,
    ) -> Result<InvoiceRecord, StoreError> {
        let record = self.read(client, invoice_id)?.ok_or_else(|| StoreError::NotFound {
            client: client.to_string(),
            invoice_id: invoice_id.to_string(),
        })?;
        if !record.status.is_held() {
            return Err(StoreError::NotHeld {
                client: client.to_string(),
                invoice_id: invoice_id.to_string(),
                status: record.status,
            });
        }

        // Archived as-is so the stored checksum stays valid.
        let bytes = serde_json::to_vec_pretty(&record).map_err(RecordError::Serialize)?;
        let archive_dir = self.root.join(ARCHIVE_DIR_NAME).join(client);
        std::fs::create_dir_all(&archive_dir).map_err(|e| io_error(&archive_dir, e))?;
        let archive_path = self.archived_record_path(client, invoice_id);
        atomic_write(&archive_dir, &archive_path, &bytes)?;

        let active_path = self.record_path(client, invoice_id);
        match std::fs::remove_file(&active_path) {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(io_error(&active_path, e)),
        }

        info!(client, invoice_id, status = %record.status, "held record rejected");
        self.audit.append(&AuditEvent::new(
            event_types::HELD_REJECTED,
            client,
            invoice_id,
            json!({"reason": reason, "status": record.status}),
        ))?;
        Ok(record)
    }

    /// All active records, checksum-verified, sorted by client and
    /// invoice id.
    ///
    /// An active record whose archived copy exists is skipped; the
    /// archive is authoritative for completed records.
    ///
    /// # Errors
    ///
    /// Propagates corruption and I/O errors; a corrupt record fails
    /// the whole scan.
    pub fn scan(&self) -> Result<Vec<InvoiceRecord>, StoreError> {
        self.scan_dir(&self.root, true)
    }

    /// All archived records, checksum-verified, sorted by client and
    /// invoice id.
    ///
    /// # Errors
    ///
    /// Same contract as [`StateStore::scan`].
    pub fn scan_archive(&self) -> Result<Vec<InvoiceRecord>, StoreError> {
        self.scan_dir(&self.root.join(ARCHIVE_DIR_NAME), false)
    }

    fn scan_dir(&self, dir: &Path, skip_shadowed: bool) -> Result<Vec<InvoiceRecord>, StoreError> {
        let mut records = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(io_error(dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_error(dir, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == ARCHIVE_DIR_NAME || !entry.path().is_dir() {
                continue;
            }
            self.scan_client_dir(&entry.path(), skip_shadowed, &mut records)?;
        }
        records.sort_by(|a, b| {
            (a.client.as_str(), a.invoice_id.as_str())
                .cmp(&(b.client.as_str(), b.invoice_id.as_str()))
        });
        Ok(records)
    }

    fn scan_client_dir(
        &self,
        dir: &Path,
        skip_shadowed: bool,
        records: &mut Vec<InvoiceRecord>,
    ) -> Result<(), StoreError> {
        let entries = std::fs::read_dir(dir).map_err(|e| io_error(dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_error(dir, e))?;
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let Some(record) = self.read_path(&path)? else {
                continue;
            };
            if skip_shadowed {
                let archived = self.archived_record_path(&record.client, &record.invoice_id);
                if std::fs::symlink_metadata(&archived).is_ok() {
                    debug!(
                        client = %record.client,
                        invoice_id = %record.invoice_id,
                        "skipping active record shadowed by archive"
                    );
                    continue;
                }
            }
            records.push(record);
        }
        Ok(())
    }

    /// Remove temp files left by interrupted atomic writes. Returns
    /// how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if a directory cannot be walked.
    pub fn sweep_temp_files(&self) -> Result<usize, StoreError> {
        sweep_dir(&self.root)
    }
}

// ---------------------------------------------------------------------------
// Filesystem helpers
// ---------------------------------------------------------------------------

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Read a whole file with a size cap, refusing symlinks.
///
/// Returns `Ok(None)` if the path does not exist.
fn read_bounded(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path, e)),
    };
    if metadata.file_type().is_symlink() {
        return Err(StoreError::SymlinkRefused {
            path: path.display().to_string(),
        });
    }
    if !metadata.is_file() {
        return Err(StoreError::NotRegularFile {
            path: path.display().to_string(),
        });
    }

    let file = std::fs::File::open(path).map_err(|e| io_error(path, e))?;
    let mut bytes = Vec::new();
    file.take(MAX_RECORD_FILE_SIZE + 1)
        .read_to_end(&mut bytes)
        .map_err(|e| io_error(path, e))?;
    if bytes.len() as u64 > MAX_RECORD_FILE_SIZE {
        return Err(StoreError::Oversized {
            path: path.display().to_string(),
            limit: MAX_RECORD_FILE_SIZE,
        });
    }
    Ok(Some(bytes))
}

/// Write bytes atomically: temp file in the same directory, fsync,
/// rename onto the final path.
fn atomic_write(dir: &Path, final_path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    match std::fs::symlink_metadata(final_path) {
        Ok(metadata) if metadata.file_type().is_symlink() => {
            return Err(StoreError::SymlinkRefused {
                path: final_path.display().to_string(),
            });
        },
        _ => {},
    }

    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| io_error(dir, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(|e| io_error(temp.path(), e))?;
    }

    temp.as_file_mut()
        .write_all(bytes)
        .map_err(|e| io_error(temp.path(), e))?;
    temp.as_file().sync_all().map_err(|e| io_error(temp.path(), e))?;
    temp.persist(final_path)
        .map_err(|e| io_error(final_path, e.error))?;
    Ok(())
}

fn sweep_dir(dir: &Path) -> Result<usize, StoreError> {
    let mut swept = 0;
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(io_error(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| io_error(dir, e))?;
        let path = entry.path();
        if path.is_dir() {
            swept += sweep_dir(&path)?;
        } else if entry.file_name().to_string_lossy().starts_with(".tmp") {
            std::fs::remove_file(&path).map_err(|e| io_error(&path, e))?;
            swept += 1;
        }
    }
    Ok(swept)
}
