//! Cross-component consistency checking.
//!
//! Two jobs live here: reconciliation (do the store's per-status
//! totals match the ledger's sections, cent for cent?) and queue
//! depth checks (is a consumer falling behind?). The stateless
//! [`ConsistencyChecker::inspect`] reports raw findings for one-shot
//! use; the stateful [`ConsistencyChecker::run`] debounces, reporting
//! only findings observed in two consecutive runs so a check that
//! lands mid-mutation does not page anyone.
//!
//! # Invariants
//!
//! - [INV-CON-001] Reconciliation is read-only; it never mutates the
//!   store, the ledger, or the queues.
//! - [INV-CON-002] A finding is reported by `run` only if the
//!   immediately preceding run observed the same finding.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ConsistencyConfig;
use crate::ledger::{Ledger, LedgerError, LedgerSection};
use crate::money;
use crate::queue::{MessageQueue, QueueError};
use crate::record::{InvoiceRecord, InvoiceStatus};
use crate::store::{StateStore, StoreError};

/// Errors from consistency checks.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConsistencyError {
    /// Store scan failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Ledger load failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Queue depth read failed.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Tuning for a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Fold archived paid records into the paid comparison. On by
    /// default: payment archives the record, so the active set alone
    /// would never balance the ledger's paid section.
    pub include_archived_paid: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            include_archived_paid: true,
        }
    }
}

/// One store/ledger total mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    /// Status whose totals disagree.
    pub status: String,
    /// Store-side total in cents.
    pub store_total_cents: i64,
    /// Ledger-side total in cents.
    pub ledger_total_cents: i64,
    /// Store minus ledger.
    pub delta_cents: i64,
}

/// One queue's depth against the configured ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepthCheck {
    /// Consumer name.
    pub queue: String,
    /// Uncommitted messages.
    pub depth: u64,
    /// Depth at which the queue is flagged.
    pub ceiling: u64,
    /// Whether the depth is below the ceiling.
    pub healthy: bool,
}

/// Full result of one consistency pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    /// When the pass ran.
    pub generated_at: DateTime<Utc>,
    /// Store totals in cents per status (archived paid folded in when
    /// the options say so).
    pub store_totals_cents: BTreeMap<String, i64>,
    /// Store record counts per status.
    pub store_counts: BTreeMap<String, usize>,
    /// Ledger totals in cents per section.
    pub ledger_totals_cents: BTreeMap<String, i64>,
    /// Total mismatches beyond tolerance.
    pub discrepancies: Vec<Discrepancy>,
    /// Per-queue depth observations.
    pub queue_depths: Vec<QueueDepthCheck>,
    /// Overall verdict.
    pub consistent: bool,
}

/// Compare store totals against ledger sections.
///
/// Comparison covers the three ledgered sections; held statuses
/// appear in the report totals but are never compared, because held
/// records deliberately have no ledger entry.
pub(crate) fn compare_store_and_ledger(
    store: &StateStore,
    ledger: &Ledger,
    options: &ReconcileOptions,
) -> Result<ReconciliationReport, ConsistencyError> {
    let mut store_totals: BTreeMap<String, i64> = BTreeMap::new();
    let mut store_counts: BTreeMap<String, usize> = BTreeMap::new();
    for status in InvoiceStatus::ALL {
        store_totals.insert(status.as_str().to_string(), 0);
        store_counts.insert(status.as_str().to_string(), 0);
    }

    let tally = |record: &InvoiceRecord,
                 totals: &mut BTreeMap<String, i64>,
                 counts: &mut BTreeMap<String, usize>| {
        let key = record.status.as_str().to_string();
        let total = totals.entry(key.clone()).or_insert(0);
        *total = total.saturating_add(record.amount_cents);
        *counts.entry(key).or_insert(0) += 1;
    };

    for record in store.scan()? {
        tally(&record, &mut store_totals, &mut store_counts);
    }
    if options.include_archived_paid {
        for record in store.scan_archive()? {
            if record.status == InvoiceStatus::Paid {
                tally(&record, &mut store_totals, &mut store_counts);
            }
        }
    }

    let doc = ledger.load()?;
    let mut ledger_totals: BTreeMap<String, i64> = BTreeMap::new();
    for section in LedgerSection::ALL {
        ledger_totals.insert(section.as_str().to_string(), doc.sum_section(section));
    }

    let mut discrepancies = Vec::new();
    for section in LedgerSection::ALL {
        if section == LedgerSection::Paid && !options.include_archived_paid {
            continue;
        }
        let store_total = store_totals.get(section.as_str()).copied().unwrap_or(0);
        let ledger_total = doc.sum_section(section);
        if !money::within_tolerance(store_total, ledger_total, ledger.tolerance_cents()) {
            discrepancies.push(Discrepancy {
                status: section.as_str().to_string(),
                store_total_cents: store_total,
                ledger_total_cents: ledger_total,
                delta_cents: store_total.saturating_sub(ledger_total),
            });
        }
    }

    let consistent = discrepancies.is_empty();
    Ok(ReconciliationReport {
        generated_at: Utc::now(),
        store_totals_cents: store_totals,
        store_counts,
        ledger_totals_cents: ledger_totals,
        discrepancies,
        queue_depths: Vec::new(),
        consistent,
    })
}

/// Periodic consistency checker with debounce state.
#[derive(Debug, Clone)]
pub struct ConsistencyChecker {
    queue_depth_ceiling: usize,
    options: ReconcileOptions,
    previous_findings: BTreeSet<String>,
}

impl ConsistencyChecker {
    /// Build a checker from validated config.
    #[must_use]
    pub fn new(config: &ConsistencyConfig) -> Self {
        Self {
            queue_depth_ceiling: config.queue_depth_ceiling,
            options: ReconcileOptions::default(),
            previous_findings: BTreeSet::new(),
        }
    }

    /// One raw pass: reconcile the store against the ledger and check
    /// every queue depth. No debounce; findings are reported as
    /// observed.
    ///
    /// # Errors
    ///
    /// Returns [`ConsistencyError`] if any side cannot be read.
    pub fn inspect(
        &self,
        store: &StateStore,
        ledger: &Ledger,
        queues: &[MessageQueue],
    ) -> Result<ReconciliationReport, ConsistencyError> {
        let mut report = compare_store_and_ledger(store, ledger, &self.options)?;
        for queue in queues {
            let depth = queue.depth()?;
            let ceiling = self.queue_depth_ceiling as u64;
            report.queue_depths.push(QueueDepthCheck {
                queue: queue.consumer().to_string(),
                depth,
                ceiling,
                healthy: depth < ceiling,
            });
        }
        report.consistent =
            report.discrepancies.is_empty() && report.queue_depths.iter().all(|q| q.healthy);
        Ok(report)
    }

    /// One debounced pass: findings are only reported (and only fail
    /// the verdict) when the previous run observed them too. First
    /// observations are remembered and logged at debug level.
    ///
    /// # Errors
    ///
    /// Returns [`ConsistencyError`] if any side cannot be read.
    pub fn run(
        &mut self,
        store: &StateStore,
        ledger: &Ledger,
        queues: &[MessageQueue],
    ) -> Result<ReconciliationReport, ConsistencyError> {
        let mut report = self.inspect(store, ledger, queues)?;
        let raw: BTreeSet<String> = findings_of(&report);
        let confirmed: BTreeSet<String> = raw
            .intersection(&self.previous_findings)
            .cloned()
            .collect();

        for finding in &confirmed {
            warn!(%finding, "consistency finding confirmed on consecutive runs");
        }
        for finding in raw.difference(&confirmed) {
            debug!(%finding, "consistency finding pending confirmation");
        }

        report
            .discrepancies
            .retain(|d| confirmed.contains(&d.status));
        report.consistent = confirmed.is_empty();
        self.previous_findings = raw;
        Ok(report)
    }
}

/// Debounce keys of a report: statuses with mismatched totals plus
/// `queue:<name>` for queues over the ceiling.
fn findings_of(report: &ReconciliationReport) -> BTreeSet<String> {
    let mut findings = BTreeSet::new();
    for discrepancy in &report.discrepancies {
        findings.insert(discrepancy.status.clone());
    }
    for queue in &report.queue_depths {
        if !queue.healthy {
            findings.insert(format!("queue:{}", queue.queue));
        }
    }
    findings
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use tempfile::TempDir;

    use super::*;
    use crate::ledger::LedgerEntry;
    use crate::record::PaymentInfo;

    const CONFIG: ConsistencyConfig = ConsistencyConfig {
        tolerance_cents: 1,
        queue_depth_ceiling: 100,
    };

    fn temp_fixtures() -> (StateStore, Ledger, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let store = StateStore::open(dir.path().join("state")).expect("store");
        let ledger = Ledger::open(dir.path().join("ledger.md"), CONFIG.tolerance_cents)
            .expect("ledger");
        (store, ledger, dir)
    }

    fn unpaid_record(invoice_id: &str, amount_cents: i64) -> InvoiceRecord {
        InvoiceRecord::new(
            "acme",
            invoice_id,
            amount_cents,
            NaiveDate::from_ymd_opt(2026, 3, 15).expect("valid date"),
            InvoiceStatus::Unpaid,
            0.99,
        )
    }

    #[test]
    fn test_balanced_store_and_ledger_is_consistent() {
        let (store, ledger, _dir) = temp_fixtures();
        store.write(unpaid_record("INV-1", 150_000)).expect("write");
        ledger
            .add_entry(
                LedgerSection::Unpaid,
                LedgerEntry::new("INV-1", 150_000, "acme"),
            )
            .expect("add");

        let checker = ConsistencyChecker::new(&CONFIG);
        let report = checker.inspect(&store, &ledger, &[]).expect("inspect");
        assert!(report.consistent);
        assert!(report.discrepancies.is_empty());
        assert_eq!(report.store_totals_cents["unpaid"], 150_000);
        assert_eq!(report.ledger_totals_cents["unpaid"], 150_000);
        assert_eq!(report.store_counts["unpaid"], 1);
    }

    #[test]
    fn test_one_cent_difference_within_tolerance() {
        let (store, ledger, _dir) = temp_fixtures();
        store.write(unpaid_record("INV-1", 150_000)).expect("write");
        ledger
            .add_entry(
                LedgerSection::Unpaid,
                LedgerEntry::new("INV-1", 150_001, "acme"),
            )
            .expect("add");

        let checker = ConsistencyChecker::new(&CONFIG);
        let report = checker.inspect(&store, &ledger, &[]).expect("inspect");
        assert!(report.consistent);
    }

    #[test]
    fn test_missing_ledger_entry_is_a_discrepancy() {
        let (store, ledger, _dir) = temp_fixtures();
        store.write(unpaid_record("INV-1", 150_000)).expect("write");

        let checker = ConsistencyChecker::new(&CONFIG);
        let report = checker.inspect(&store, &ledger, &[]).expect("inspect");
        assert!(!report.consistent);
        assert_eq!(report.discrepancies.len(), 1);
        assert_eq!(report.discrepancies[0].status, "unpaid");
        assert_eq!(report.discrepancies[0].delta_cents, 150_000);
    }

    #[test]
    fn test_archived_paid_counts_toward_paid_total() {
        let (store, ledger, _dir) = temp_fixtures();
        store.write(unpaid_record("INV-1", 150_000)).expect("write");
        ledger
            .add_entry(
                LedgerSection::Unpaid,
                LedgerEntry::new("INV-1", 150_000, "acme"),
            )
            .expect("add");
        store
            .mark_paid(
                "acme",
                "INV-1",
                PaymentInfo {
                    method: "ach".to_string(),
                    paid_at: Utc::now(),
                    amount_cents: 150_000,
                    source_reference: None,
                },
            )
            .expect("mark paid");
        ledger
            .move_entry("INV-1", LedgerSection::Unpaid, LedgerSection::Paid)
            .expect("move");

        let checker = ConsistencyChecker::new(&CONFIG);
        let report = checker.inspect(&store, &ledger, &[]).expect("inspect");
        assert!(report.consistent, "discrepancies: {:?}", report.discrepancies);
        assert_eq!(report.store_totals_cents["paid"], 150_000);
        assert_eq!(report.ledger_totals_cents["paid"], 150_000);
    }

    #[test]
    fn test_held_records_are_not_compared() {
        let (store, ledger, _dir) = temp_fixtures();
        let mut record = unpaid_record("INV-1", 150_000);
        record.status = InvoiceStatus::Review;
        store.write(record).expect("write");

        let checker = ConsistencyChecker::new(&CONFIG);
        let report = checker.inspect(&store, &ledger, &[]).expect("inspect");
        assert!(report.consistent);
        assert_eq!(report.store_totals_cents["review"], 150_000);
    }

    #[test]
    fn test_queue_over_ceiling_flagged() {
        let (store, ledger, dir) = temp_fixtures();
        let queue = MessageQueue::open(
            dir.path().join("queues"),
            "emailer",
            std::time::Duration::from_secs(60 * 60),
        )
        .expect("queue");
        for i in 0..3 {
            queue
                .send(&crate::queue::QueueMessage::new(
                    "payment_received",
                    "acme",
                    &format!("INV-{i}"),
                    serde_json::json!({}),
                ))
                .expect("send");
        }

        let config = ConsistencyConfig {
            tolerance_cents: 1,
            queue_depth_ceiling: 2,
        };
        let checker = ConsistencyChecker::new(&config);
        let report = checker
            .inspect(&store, &ledger, std::slice::from_ref(&queue))
            .expect("inspect");
        assert!(!report.consistent);
        assert_eq!(report.queue_depths.len(), 1);
        assert!(!report.queue_depths[0].healthy);
        assert_eq!(report.queue_depths[0].depth, 3);
    }

    #[test]
    fn test_run_debounces_first_observation() {
        let (store, ledger, _dir) = temp_fixtures();
        store.write(unpaid_record("INV-1", 150_000)).expect("write");

        let mut checker = ConsistencyChecker::new(&CONFIG);
        let first = checker.run(&store, &ledger, &[]).expect("run 1");
        assert!(first.consistent, "first observation must not report");
        assert!(first.discrepancies.is_empty());

        let second = checker.run(&store, &ledger, &[]).expect("run 2");
        assert!(!second.consistent, "confirmed on the second run");
        assert_eq!(second.discrepancies.len(), 1);
        assert_eq!(second.discrepancies[0].status, "unpaid");
    }

    #[test]
    fn test_run_clears_fixed_finding() {
        let (store, ledger, _dir) = temp_fixtures();
        store.write(unpaid_record("INV-1", 150_000)).expect("write");

        let mut checker = ConsistencyChecker::new(&CONFIG);
        checker.run(&store, &ledger, &[]).expect("run 1");

        // Operator fixes the ledger before the second run.
        ledger
            .add_entry(
                LedgerSection::Unpaid,
                LedgerEntry::new("INV-1", 150_000, "acme"),
            )
            .expect("add");

        let second = checker.run(&store, &ledger, &[]).expect("run 2");
        assert!(second.consistent);
        let third = checker.run(&store, &ledger, &[]).expect("run 3");
        assert!(third.consistent);
    }

    #[test]
    fn test_report_serializes_round_trip() {
        let (store, ledger, _dir) = temp_fixtures();
        let checker = ConsistencyChecker::new(&CONFIG);
        let report = checker.inspect(&store, &ledger, &[]).expect("inspect");
        let json = serde_json::to_string(&report).expect("serialize");
        let parsed: ReconciliationReport = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed, report);
    }
}
