//! Invoice records and their status lifecycle.
//!
//! An [`InvoiceRecord`] is the unit of persistence: one live record per
//! (client, invoice id), plus immutable archived snapshots keyed the
//! same way. Records carry an embedded content checksum so that a read
//! can prove the bytes on disk are the bytes that were written.
//!
//! # File Format
//!
//! ```json
//! {
//!   "schema": "dunning.invoice_record.v1",
//!   "client": "acme",
//!   "invoice_id": "INV-100",
//!   "amount_cents": 150000,
//!   "due_date": "2026-03-01",
//!   "status": "unpaid",
//!   "confidence": 0.97,
//!   "checksum": "9f2c4a1d0b3e5f67",
//!   "updated_at": "2026-02-01T09:30:00Z"
//! }
//! ```
//!
//! # Invariants
//!
//! - [INV-REC-001] The checksum is computed over the canonical
//!   (sorted-key) JSON serialization with the `checksum` and
//!   `updated_at` fields removed; it covers every content field.
//! - [INV-REC-002] Status transitions follow the table in
//!   [`InvoiceStatus::can_transition_to`]; `paid` and `escalated` are
//!   terminal.

use std::fmt;
use std::fmt::Write as _;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Schema identifier for persisted invoice records.
pub const RECORD_SCHEMA: &str = "dunning.invoice_record.v1";

/// Length of the hex checksum embedded in each record (a truncated
/// SHA-256 digest).
pub const CHECKSUM_HEX_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Errors from encoding a record for hashing or persistence.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RecordError {
    /// Record serialization failed.
    #[error("record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Lifecycle status of an invoice record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    /// Awaiting payment; eligible for dunning notices.
    Unpaid,
    /// Payment observed; terminal, reached through archiving.
    Paid,
    /// Handed to an operator after supervisor judgment; terminal.
    Escalated,
    /// Held for human confirmation of a medium-confidence extraction.
    Review,
    /// Held for full manual entry of a low-confidence extraction.
    Manual,
}

impl InvoiceStatus {
    /// All statuses, in display order.
    pub const ALL: [Self; 5] = [
        Self::Unpaid,
        Self::Paid,
        Self::Escalated,
        Self::Review,
        Self::Manual,
    ];

    /// Lowercase identifier used in files, the ledger, and reports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unpaid => "unpaid",
            Self::Paid => "paid",
            Self::Escalated => "escalated",
            Self::Review => "review",
            Self::Manual => "manual",
        }
    }

    /// Whether the status ends the record's active lifecycle.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Paid | Self::Escalated)
    }

    /// Whether the record is held pending human action.
    #[must_use]
    pub const fn is_held(self) -> bool {
        matches!(self, Self::Review | Self::Manual)
    }

    /// Whether a write may move a record from `self` to `next`.
    ///
    /// Rewrites at the same status are always allowed (idempotent
    /// retries depend on this). Held records may be promoted to
    /// `unpaid` or reclassified between the held states. Everything
    /// else, notably `paid -> unpaid`, is rejected.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Unpaid, Self::Unpaid | Self::Paid | Self::Escalated)
                | (Self::Review, Self::Review | Self::Unpaid | Self::Manual)
                | (Self::Manual, Self::Manual | Self::Unpaid | Self::Review)
                | (Self::Paid, Self::Paid)
                | (Self::Escalated, Self::Escalated)
        )
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment metadata attached to a record when a payment is observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PaymentInfo {
    /// How the payment arrived (e.g. `bank_transfer`).
    pub method: String,
    /// When the payment was observed.
    pub paid_at: DateTime<Utc>,
    /// Paid amount in cents.
    pub amount_cents: i64,
    /// Reference from the payment source (statement line, transaction
    /// id), when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_reference: Option<String>,
}

/// A single invoice record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InvoiceRecord {
    /// Schema identifier.
    pub schema: String,
    /// Client the invoice was issued to.
    pub client: String,
    /// Invoice identifier, unique per client.
    pub invoice_id: String,
    /// Invoiced amount in cents.
    pub amount_cents: i64,
    /// Payment due date.
    pub due_date: NaiveDate,
    /// Lifecycle status.
    pub status: InvoiceStatus,
    /// Extraction confidence recorded at routing time, in `[0, 1]`.
    pub confidence: f64,
    /// Truncated SHA-256 over the canonical serialization, excluding
    /// this field and `updated_at`.
    #[serde(default)]
    pub checksum: String,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
    /// Payment metadata, present once the invoice is paid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentInfo>,
}

impl InvoiceRecord {
    /// Create a record with an empty checksum; [`Self::seal`] fills it
    /// in at write time.
    #[must_use]
    pub fn new(
        client: impl Into<String>,
        invoice_id: impl Into<String>,
        amount_cents: i64,
        due_date: NaiveDate,
        status: InvoiceStatus,
        confidence: f64,
    ) -> Self {
        Self {
            schema: RECORD_SCHEMA.to_string(),
            client: client.into(),
            invoice_id: invoice_id.into(),
            amount_cents,
            due_date,
            status,
            confidence,
            checksum: String::new(),
            updated_at: Utc::now(),
            payment: None,
        }
    }

    /// Compute the content checksum over everything except `checksum`
    /// and `updated_at`.
    ///
    /// Serialization goes through a JSON value with sorted keys, so the
    /// digest is independent of field declaration order.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Serialize`] if the record cannot be
    /// serialized.
    pub fn compute_checksum(&self) -> Result<String, RecordError> {
        let mut value = serde_json::to_value(self)?;
        if let Some(object) = value.as_object_mut() {
            object.remove("checksum");
            object.remove("updated_at");
        }
        let canonical = serde_json::to_string(&value)?;
        let digest = Sha256::digest(canonical.as_bytes());
        let mut hex = hex_encode(&digest);
        hex.truncate(CHECKSUM_HEX_LEN);
        Ok(hex)
    }

    /// Stamp `updated_at` and embed a fresh content checksum.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Serialize`] if the record cannot be
    /// serialized for hashing.
    pub fn seal(&mut self) -> Result<(), RecordError> {
        self.updated_at = Utc::now();
        self.checksum = self.compute_checksum()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Hex-encodes a digest.
pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut acc, b| {
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> InvoiceRecord {
        InvoiceRecord::new(
            "acme",
            "INV-100",
            150_000,
            NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            InvoiceStatus::Unpaid,
            0.97,
        )
    }

    #[test]
    fn test_checksum_is_stable_for_identical_content() {
        let a = sample_record();
        let mut b = sample_record();
        // Only metadata differs.
        b.updated_at = a.updated_at + chrono::Duration::seconds(90);
        assert_eq!(
            a.compute_checksum().unwrap(),
            b.compute_checksum().unwrap()
        );
    }

    #[test]
    fn test_checksum_changes_with_content() {
        let a = sample_record();
        let mut b = sample_record();
        b.amount_cents = 150_001;
        assert_ne!(
            a.compute_checksum().unwrap(),
            b.compute_checksum().unwrap()
        );
    }

    #[test]
    fn test_checksum_covers_payment() {
        let a = sample_record();
        let mut b = sample_record();
        b.payment = Some(PaymentInfo {
            method: "bank_transfer".to_string(),
            paid_at: Utc::now(),
            amount_cents: 150_000,
            source_reference: None,
        });
        assert_ne!(
            a.compute_checksum().unwrap(),
            b.compute_checksum().unwrap()
        );
    }

    #[test]
    fn test_seal_embeds_matching_checksum() {
        let mut record = sample_record();
        record.seal().unwrap();
        assert_eq!(record.checksum.len(), CHECKSUM_HEX_LEN);
        assert_eq!(record.checksum, record.compute_checksum().unwrap());
    }

    #[test]
    fn test_transition_table() {
        use InvoiceStatus::{Escalated, Manual, Paid, Review, Unpaid};

        assert!(Unpaid.can_transition_to(Paid));
        assert!(Unpaid.can_transition_to(Escalated));
        assert!(Review.can_transition_to(Unpaid));
        assert!(Review.can_transition_to(Manual));
        assert!(Manual.can_transition_to(Unpaid));
        assert!(Manual.can_transition_to(Review));

        // Same-status rewrites are always allowed.
        for status in InvoiceStatus::ALL {
            assert!(status.can_transition_to(status));
        }

        // Terminal states stay terminal.
        assert!(!Paid.can_transition_to(Unpaid));
        assert!(!Paid.can_transition_to(Escalated));
        assert!(!Escalated.can_transition_to(Unpaid));
        assert!(!Unpaid.can_transition_to(Review));
        assert!(!Unpaid.can_transition_to(Manual));
    }

    #[test]
    fn test_status_serde_uses_snake_case() {
        let json = serde_json::to_string(&InvoiceStatus::Escalated).unwrap();
        assert_eq!(json, "\"escalated\"");
        let parsed: InvoiceStatus = serde_json::from_str("\"review\"").unwrap();
        assert_eq!(parsed, InvoiceStatus::Review);
    }

    #[test]
    fn test_record_serde_round_trip() {
        let mut record = sample_record();
        record.seal().unwrap();
        let json = serde_json::to_string_pretty(&record).unwrap();
        let parsed: InvoiceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(parsed.compute_checksum().unwrap(), record.checksum);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let mut value = serde_json::to_value(sample_record()).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("surprise".to_string(), serde_json::Value::Null);
        let parsed: Result<InvoiceRecord, _> = serde_json::from_value(value);
        assert!(parsed.is_err());
    }
}
