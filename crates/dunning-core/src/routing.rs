//! Confidence-weighted routing of parsed invoices.
//!
//! Upstream parsers emit a [`ParsedInvoice`]: extracted fields plus a
//! per-field confidence in `[0.0, 1.0]`. The router folds those into
//! one weighted score and picks a disposition:
//!
//! - score `>= auto_threshold`: record created as unpaid and entered
//!   into the ledger, no human involved;
//! - score `>= review_threshold`: record held for operator review,
//!   kept out of the ledger until promoted;
//! - anything lower: record held for manual data entry.
//!
//! A field missing from the confidence map scores zero, so a parser
//! that failed to extract a field drags the invoice toward a human.
//!
//! # Invariants
//!
//! - [INV-RTR-001] Routing never discards: every accepted invoice
//!   lands in the store under some status.
//! - [INV-RTR-002] Held invoices leave no ledger trace; the ledger
//!   only ever reflects auto-accepted or promoted records.

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::audit::event_types;
use crate::config::{FieldWeights, RoutingConfig};
use crate::ledger::{Ledger, LedgerEntry, LedgerError, LedgerSection};
use crate::record::{InvoiceRecord, InvoiceStatus};
use crate::store::{StateStore, StoreError};

/// Field names recognized by the scoring weights.
pub mod fields {
    /// Extracted invoice id.
    pub const INVOICE_ID: &str = "invoice_id";
    /// Extracted amount.
    pub const AMOUNT: &str = "amount";
    /// Extracted due date.
    pub const DUE_DATE: &str = "due_date";
    /// Extracted line items.
    pub const LINE_ITEMS: &str = "line_items";
}

/// Errors from routing a parsed invoice.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RoutingError {
    /// A confidence value is outside `[0.0, 1.0]` or not finite.
    #[error("confidence for field {field:?} must be in [0.0, 1.0], got {value}")]
    InvalidConfidence {
        /// The offending field name.
        field: String,
        /// The rejected value.
        value: f64,
    },

    /// Store write failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Ledger update failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Output of an upstream parser, ready for routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParsedInvoice {
    /// Client the invoice belongs to.
    pub client: String,
    /// Extracted invoice id.
    pub invoice_id: String,
    /// Extracted amount in cents.
    pub amount_cents: i64,
    /// Extracted due date.
    pub due_date: chrono::NaiveDate,
    /// Per-field extraction confidence, keyed by [`fields`] names.
    pub field_confidences: std::collections::BTreeMap<String, f64>,
}

/// Where a parsed invoice ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Accepted without human involvement.
    Auto,
    /// Held for operator review.
    Review,
    /// Held for manual data entry.
    Manual,
}

impl Disposition {
    /// Lowercase name for logs and reports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Review => "review",
            Self::Manual => "manual",
        }
    }

    /// Status a freshly routed record starts in.
    #[must_use]
    pub const fn initial_status(self) -> InvoiceStatus {
        match self {
            Self::Auto => InvoiceStatus::Unpaid,
            Self::Review => InvoiceStatus::Review,
            Self::Manual => InvoiceStatus::Manual,
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of routing one parsed invoice.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingOutcome {
    /// Chosen disposition.
    pub disposition: Disposition,
    /// The weighted confidence score.
    pub confidence: f64,
    /// The record as written to the store.
    pub record: InvoiceRecord,
}

/// Scores parsed invoices and lands them in the store.
#[derive(Debug, Clone)]
pub struct ConfidenceRouter {
    weights: FieldWeights,
    auto_threshold: f64,
    review_threshold: f64,
}

impl ConfidenceRouter {
    /// Build a router from validated routing config.
    #[must_use]
    pub const fn new(config: &RoutingConfig) -> Self {
        Self {
            weights: config.weights,
            auto_threshold: config.auto_threshold,
            review_threshold: config.review_threshold,
        }
    }

    /// Weighted confidence score of a parsed invoice. Fields absent
    /// from the confidence map contribute zero.
    #[must_use]
    pub fn score(&self, invoice: &ParsedInvoice) -> f64 {
        let lookup = |field: &str| {
            invoice
                .field_confidences
                .get(field)
                .copied()
                .unwrap_or(0.0)
        };
        self.weights.invoice_id * lookup(fields::INVOICE_ID)
            + self.weights.amount * lookup(fields::AMOUNT)
            + self.weights.due_date * lookup(fields::DUE_DATE)
            + self.weights.line_items * lookup(fields::LINE_ITEMS)
    }

    /// Disposition for a score.
    #[must_use]
    pub fn classify(&self, score: f64) -> Disposition {
        if score >= self.auto_threshold {
            Disposition::Auto
        } else if score >= self.review_threshold {
            Disposition::Review
        } else {
            Disposition::Manual
        }
    }

    /// Route a parsed invoice: score it, write the record under the
    /// disposition's initial status, and (for auto acceptance) enter
    /// it into the ledger.
    ///
    /// Retrying the same invoice is tolerated: the store accepts the
    /// unchanged status and an already-present ledger entry is kept
    /// rather than duplicated.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::InvalidConfidence`] before any write if
    /// a confidence is out of range, or store and ledger errors from
    /// the writes.
    pub fn route(
        &self,
        invoice: &ParsedInvoice,
        store: &StateStore,
        ledger: &Ledger,
    ) -> Result<RoutingOutcome, RoutingError> {
        for (field, value) in &invoice.field_confidences {
            if !value.is_finite() || !(0.0..=1.0).contains(value) {
                return Err(RoutingError::InvalidConfidence {
                    field: field.clone(),
                    value: *value,
                });
            }
        }

        let confidence = self.score(invoice);
        let disposition = self.classify(confidence);
        let record = InvoiceRecord::new(
            &invoice.client,
            &invoice.invoice_id,
            invoice.amount_cents,
            invoice.due_date,
            disposition.initial_status(),
            confidence,
        );
        let payload = json!({
            "disposition": disposition,
            "confidence": confidence,
            "amount_cents": invoice.amount_cents,
        });
        let record = store.write_with_event(record, event_types::INVOICE_ROUTED, payload)?;

        if disposition == Disposition::Auto {
            let entry = LedgerEntry::new(&record.invoice_id, record.amount_cents, &record.client);
            match ledger.add_entry(LedgerSection::Unpaid, entry) {
                Ok(()) => {},
                Err(LedgerError::DuplicateEntry { invoice_id, section }) => {
                    warn!(%invoice_id, %section, "ledger entry already present, keeping it");
                },
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            client = %record.client,
            invoice_id = %record.invoice_id,
            disposition = %disposition,
            confidence,
            "invoice routed"
        );
        Ok(RoutingOutcome {
            disposition,
            confidence,
            record,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use tempfile::TempDir;

    use super::*;
    use crate::config::RoutingConfig;

    fn temp_fixtures() -> (StateStore, Ledger, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let store = StateStore::open(dir.path().join("state")).expect("store");
        let ledger = Ledger::open(dir.path().join("ledger.md"), 1).expect("ledger");
        (store, ledger, dir)
    }

    fn parsed(confidences: &[(&str, f64)]) -> ParsedInvoice {
        ParsedInvoice {
            client: "acme".to_string(),
            invoice_id: "INV-100".to_string(),
            amount_cents: 150_000,
            due_date: NaiveDate::from_ymd_opt(2026, 3, 15).expect("valid date"),
            field_confidences: confidences
                .iter()
                .map(|(k, v)| ((*k).to_string(), *v))
                .collect(),
        }
    }

    fn default_router() -> ConfidenceRouter {
        ConfidenceRouter::new(&RoutingConfig::default())
    }

    #[test]
    fn test_missing_line_items_drags_score_to_manual() {
        let router = default_router();
        let invoice = parsed(&[
            (fields::INVOICE_ID, 1.0),
            (fields::AMOUNT, 0.95),
            (fields::DUE_DATE, 0.9),
            (fields::LINE_ITEMS, 0.0),
        ]);

        let score = router.score(&invoice);
        assert!((score - 0.81).abs() < 1e-9);
        assert_eq!(router.classify(score), Disposition::Manual);
    }

    #[test]
    fn test_absent_fields_score_zero() {
        let router = default_router();
        let invoice = parsed(&[(fields::INVOICE_ID, 1.0)]);
        let score = router.score(&invoice);
        assert!((score - 0.30).abs() < 1e-9);
    }

    #[test]
    fn test_classify_thresholds_are_inclusive() {
        let router = default_router();
        assert_eq!(router.classify(1.0), Disposition::Auto);
        assert_eq!(router.classify(0.95), Disposition::Auto);
        assert_eq!(router.classify(0.949), Disposition::Review);
        assert_eq!(router.classify(0.85), Disposition::Review);
        assert_eq!(router.classify(0.849), Disposition::Manual);
        assert_eq!(router.classify(0.0), Disposition::Manual);
    }

    #[test]
    fn test_auto_route_writes_unpaid_and_ledger_entry() {
        let (store, ledger, _dir) = temp_fixtures();
        let router = default_router();
        let invoice = parsed(&[
            (fields::INVOICE_ID, 1.0),
            (fields::AMOUNT, 1.0),
            (fields::DUE_DATE, 1.0),
            (fields::LINE_ITEMS, 1.0),
        ]);

        let outcome = router.route(&invoice, &store, &ledger).expect("route");
        assert_eq!(outcome.disposition, Disposition::Auto);
        assert_eq!(outcome.record.status, InvoiceStatus::Unpaid);

        let stored = store
            .read("acme", "INV-100")
            .expect("read")
            .expect("record");
        assert_eq!(stored.status, InvoiceStatus::Unpaid);
        assert!((stored.confidence - 1.0).abs() < 1e-9);

        let entries = ledger.entries(LedgerSection::Unpaid).expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].invoice_id, "INV-100");
        assert_eq!(entries[0].amount_cents, 150_000);
    }

    #[test]
    fn test_review_route_is_held_without_ledger_entry() {
        let (store, ledger, _dir) = temp_fixtures();
        let router = default_router();
        let invoice = parsed(&[
            (fields::INVOICE_ID, 1.0),
            (fields::AMOUNT, 1.0),
            (fields::DUE_DATE, 1.0),
            (fields::LINE_ITEMS, 0.4),
        ]);

        let outcome = router.route(&invoice, &store, &ledger).expect("route");
        assert_eq!(outcome.disposition, Disposition::Review);
        assert_eq!(outcome.record.status, InvoiceStatus::Review);
        assert!(
            ledger
                .entries(LedgerSection::Unpaid)
                .expect("entries")
                .is_empty()
        );
    }

    #[test]
    fn test_manual_route_is_held_without_ledger_entry() {
        let (store, ledger, _dir) = temp_fixtures();
        let router = default_router();
        let invoice = parsed(&[(fields::AMOUNT, 0.5)]);

        let outcome = router.route(&invoice, &store, &ledger).expect("route");
        assert_eq!(outcome.disposition, Disposition::Manual);
        assert_eq!(outcome.record.status, InvoiceStatus::Manual);
        assert_eq!(ledger.load().expect("load").total_entries(), 0);
    }

    #[test]
    fn test_retrying_auto_route_keeps_single_ledger_entry() {
        let (store, ledger, _dir) = temp_fixtures();
        let router = default_router();
        let invoice = parsed(&[
            (fields::INVOICE_ID, 1.0),
            (fields::AMOUNT, 1.0),
            (fields::DUE_DATE, 1.0),
            (fields::LINE_ITEMS, 1.0),
        ]);

        router.route(&invoice, &store, &ledger).expect("first");
        router.route(&invoice, &store, &ledger).expect("retry");
        assert_eq!(
            ledger.entries(LedgerSection::Unpaid).expect("entries").len(),
            1
        );
    }

    #[test]
    fn test_out_of_range_confidence_rejected_before_write() {
        let (store, ledger, _dir) = temp_fixtures();
        let router = default_router();
        let invoice = parsed(&[(fields::AMOUNT, 1.5)]);

        let err = router
            .route(&invoice, &store, &ledger)
            .expect_err("out of range");
        assert!(matches!(
            err,
            RoutingError::InvalidConfidence { value, .. } if (value - 1.5).abs() < 1e-9
        ));
        assert!(store.read("acme", "INV-100").expect("read").is_none());

        let nan = parsed(&[(fields::AMOUNT, f64::NAN)]);
        assert!(router.route(&nan, &store, &ledger).is_err());
    }
}
