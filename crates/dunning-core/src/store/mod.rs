//! Checksummed invoice record store.
//!
//! This module owns the on-disk state of every invoice: one JSON file
//! per record under `<state_dir>/<client>/<invoice>.json`, a parallel
//! archive of terminal records under `<state_dir>/archive/`, and the
//! audit log that every mutation appends to.
//!
//! # Features
//!
//! - **Atomic writes**: every record lands via temp file + rename, so
//!   readers never observe a torn file.
//! - **Checksum verification**: reads recompute the embedded checksum
//!   and surface silent corruption as a hard error.
//! - **Transition enforcement**: a status change is only persisted if
//!   the record's transition table allows it.
//! - **Authoritative archive**: once a record is archived, a lingering
//!   active copy (from a crash mid-archive) is ignored by scans and
//!   cleaned up by the next payment retry.
//!
//! # Invariants
//!
//! - [INV-STO-001] Client and invoice identifiers are validated before
//!   they touch a path; traversal components never reach the
//!   filesystem.
//! - [INV-STO-002] The audit event for a mutation is appended after
//!   the state write commits, never before.
//! - [INV-STO-003] Reads are bounded and refuse symlinks.

mod state;


pub use state::{
    ARCHIVE_DIR_NAME, MAX_IDENTIFIER_LEN, MAX_RECORD_FILE_SIZE, StateStore, StoreError,
};
pub(crate) use state::is_safe_component;
