//! End-to-end tests of the collections lifecycle.
//!
//! These drive the full stack through [`CollectionsContext`] against
//! real temporary directories: routing, payment, escalation,
//! held-invoice handling, heartbeat supervision, and consistency
//! checking.
//!
//! # Test Coverage
//!
//! - Happy path: parse, auto-route, pay; consistent at every step
//! - Held invoices: review and manual routing, promotion, rejection
//! - Supervision: stale heartbeats restart, then escalate exactly once
//! - Consistency: drift is debounced, then reported until repaired
//! - Crash recovery: an interrupted payment converges on retry

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, Utc};
use tempfile::TempDir;

use dunning_core::config::{CollectionsConfig, PathsConfig};
use dunning_core::context::CollectionsContext;
use dunning_core::health::{AgentState, OperatorNotifier, ProcessControl, write_heartbeat};
use dunning_core::ledger::LedgerSection;
use dunning_core::record::{InvoiceStatus, PaymentInfo};
use dunning_core::routing::{Disposition, ParsedInvoice, fields};

// ============================================================================
// Test doubles
// ============================================================================

type Recorded = Arc<Mutex<Vec<String>>>;

/// Notifier that records escalation messages instead of logging them.
struct RecordingNotifier(Recorded);

impl OperatorNotifier for RecordingNotifier {
    fn notify(&self, message: &str) {
        self.0.lock().expect("notifier lock").push(message.to_string());
    }
}

/// Process control that records restart requests.
struct RecordingControl(Recorded);

impl ProcessControl for RecordingControl {
    fn request_restart(&self, agent: &str) {
        self.0.lock().expect("control lock").push(agent.to_string());
    }
}

// ============================================================================
// Fixtures
// ============================================================================

fn temp_config(dir: &TempDir) -> CollectionsConfig {
    CollectionsConfig::with_paths(PathsConfig {
        state_dir: dir.path().join("state"),
        ledger_file: dir.path().join("ledger.md"),
        heartbeat_dir: dir.path().join("heartbeats"),
        queue_dir: dir.path().join("queues"),
    })
}

fn temp_context(dir: &TempDir) -> CollectionsContext {
    CollectionsContext::new(temp_config(dir)).expect("context")
}

fn parsed(client: &str, invoice_id: &str, amount_cents: i64, confidence: f64) -> ParsedInvoice {
    let mut field_confidences = BTreeMap::new();
    for field in [
        fields::INVOICE_ID,
        fields::AMOUNT,
        fields::DUE_DATE,
        fields::LINE_ITEMS,
    ] {
        field_confidences.insert(field.to_string(), confidence);
    }
    ParsedInvoice {
        client: client.to_string(),
        invoice_id: invoice_id.to_string(),
        amount_cents,
        due_date: NaiveDate::from_ymd_opt(2026, 4, 30).expect("valid date"),
        field_confidences,
    }
}

fn ach_payment(amount_cents: i64) -> PaymentInfo {
    PaymentInfo {
        method: "ach".to_string(),
        paid_at: Utc::now(),
        amount_cents,
        source_reference: Some("bank-stmt-0042".to_string()),
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_invoice_lifecycle_parse_to_paid() {
    let dir = TempDir::new().expect("tempdir");
    let mut ctx = temp_context(&dir);

    let outcome = ctx
        .route_invoice(&parsed("acme", "INV-100", 150_000, 0.97))
        .expect("route");
    assert_eq!(outcome.disposition, Disposition::Auto);
    assert_eq!(outcome.record.status, InvoiceStatus::Unpaid);

    let snapshot = ctx.snapshot().expect("snapshot");
    assert_eq!(snapshot.active_counts["unpaid"], 1);
    assert_eq!(snapshot.active_totals_cents["unpaid"], 150_000);
    assert!(ctx.inspect_consistency().expect("inspect").consistent);

    let paid = ctx
        .record_payment("acme", "INV-100", ach_payment(150_000))
        .expect("pay");
    assert_eq!(paid.status, InvoiceStatus::Paid);
    assert_eq!(
        paid.payment.as_ref().map(|p| p.amount_cents),
        Some(150_000)
    );

    // Active record is gone; the archive holds the paid copy.
    assert!(ctx.store().read("acme", "INV-100").expect("read").is_none());
    let archived = ctx
        .store()
        .read_archived("acme", "INV-100")
        .expect("read archived")
        .expect("archived record");
    assert_eq!(archived.status, InvoiceStatus::Paid);

    // Ledger moved the entry to paid.
    let paid_entries = ctx.ledger().entries(LedgerSection::Paid).expect("entries");
    assert_eq!(paid_entries.len(), 1);
    assert_eq!(paid_entries[0].invoice_id, "INV-100");
    assert!(
        ctx.ledger()
            .entries(LedgerSection::Unpaid)
            .expect("entries")
            .is_empty()
    );

    // The emailer was notified exactly once; the consumer can drain
    // and commit the batch.
    let emailer = ctx.queue("emailer").expect("emailer queue");
    let batch = emailer.pending().expect("pending");
    assert_eq!(batch.messages.len(), 1);
    assert_eq!(batch.messages[0].kind, "payment_received");
    assert_eq!(batch.messages[0].invoice_id, "INV-100");
    assert_eq!(batch.messages[0].payload["amount_cents"], 150_000);
    emailer.commit(batch.end_offset).expect("commit");
    assert_eq!(emailer.depth().expect("depth"), 0);

    assert!(ctx.check_consistency().expect("consistency").consistent);

    // The audit trail tells the whole story, in order.
    let events = ctx.audit().replay(None).expect("replay");
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, ["invoice_routed", "marked_paid"]);
}

#[test]
fn test_escalation_moves_money_to_escalated() {
    let dir = TempDir::new().expect("tempdir");
    let mut ctx = temp_context(&dir);

    ctx.route_invoice(&parsed("acme", "INV-200", 88_000, 1.0))
        .expect("route");
    let record = ctx
        .escalate_invoice("acme", "INV-200", "unresponsive after 3 reminders")
        .expect("escalate");
    assert_eq!(record.status, InvoiceStatus::Escalated);

    let escalated = ctx
        .ledger()
        .entries(LedgerSection::Escalated)
        .expect("entries");
    assert_eq!(escalated.len(), 1);
    assert_eq!(escalated[0].amount_cents, 88_000);
    assert!(ctx.check_consistency().expect("consistency").consistent);

    let events = ctx.audit().replay(None).expect("replay");
    assert_eq!(events.last().map(|e| e.event_type.as_str()), Some("escalated"));
    assert_eq!(
        events.last().map(|e| e.payload["reason"].clone()),
        Some(serde_json::json!("unresponsive after 3 reminders"))
    );
}

// ============================================================================
// Held invoices
// ============================================================================

#[test]
fn test_review_invoice_promoted_then_paid() {
    let dir = TempDir::new().expect("tempdir");
    let mut ctx = temp_context(&dir);

    // 0.9 lands between the review (0.85) and auto (0.95) thresholds.
    let outcome = ctx
        .route_invoice(&parsed("acme", "INV-300", 64_100, 0.9))
        .expect("route");
    assert_eq!(outcome.disposition, Disposition::Review);
    assert_eq!(outcome.record.status, InvoiceStatus::Review);

    // Held money is not in the ledger and not a discrepancy.
    assert!(
        ctx.ledger()
            .entries(LedgerSection::Unpaid)
            .expect("entries")
            .is_empty()
    );
    assert!(ctx.inspect_consistency().expect("inspect").consistent);

    let promoted = ctx.promote_held("acme", "INV-300").expect("promote");
    assert_eq!(promoted.status, InvoiceStatus::Unpaid);
    assert_eq!(
        ctx.ledger()
            .entries(LedgerSection::Unpaid)
            .expect("entries")
            .len(),
        1
    );

    ctx.record_payment("acme", "INV-300", ach_payment(64_100))
        .expect("pay");
    assert!(ctx.check_consistency().expect("consistency").consistent);
}

#[test]
fn test_manual_invoice_rejected_into_archive() {
    let dir = TempDir::new().expect("tempdir");
    let mut ctx = temp_context(&dir);

    let outcome = ctx
        .route_invoice(&parsed("acme", "INV-400", 12_000, 0.3))
        .expect("route");
    assert_eq!(outcome.disposition, Disposition::Manual);

    let rejected = ctx
        .reject_held("acme", "INV-400", "duplicate of INV-399")
        .expect("reject");
    assert_eq!(rejected.status, InvoiceStatus::Manual);

    assert!(ctx.store().read("acme", "INV-400").expect("read").is_none());
    assert!(
        ctx.store()
            .read_archived("acme", "INV-400")
            .expect("read")
            .is_some()
    );

    // Rejected money never touches the ledger or the totals.
    let snapshot = ctx.snapshot().expect("snapshot");
    assert_eq!(snapshot.archived_count, 1);
    assert_eq!(snapshot.archived_paid_total_cents, 0);
    assert!(ctx.check_consistency().expect("consistency").consistent);
}

// ============================================================================
// Consistency
// ============================================================================

#[test]
fn test_drift_is_debounced_then_reported_until_repaired() {
    let dir = TempDir::new().expect("tempdir");
    let mut ctx = temp_context(&dir);

    // A record written behind the router's back has no ledger entry.
    let record = dunning_core::record::InvoiceRecord::new(
        "acme",
        "INV-500",
        42_000,
        NaiveDate::from_ymd_opt(2026, 4, 30).expect("valid date"),
        InvoiceStatus::Unpaid,
        0.99,
    );
    ctx.store().write(record).expect("write");

    let first = ctx.check_consistency().expect("run 1");
    assert!(first.consistent, "first observation is held back");

    let second = ctx.check_consistency().expect("run 2");
    assert!(!second.consistent);
    assert_eq!(second.discrepancies.len(), 1);
    assert_eq!(second.discrepancies[0].status, "unpaid");
    assert_eq!(second.discrepancies[0].delta_cents, 42_000);

    // Repair the ledger; the finding clears immediately.
    ctx.ledger()
        .add_entry(
            LedgerSection::Unpaid,
            dunning_core::ledger::LedgerEntry::new("INV-500", 42_000, "acme"),
        )
        .expect("repair");
    assert!(ctx.check_consistency().expect("run 3").consistent);
    assert!(ctx.check_consistency().expect("run 4").consistent);
}

#[test]
fn test_interrupted_payment_converges_on_retry() {
    let dir = TempDir::new().expect("tempdir");
    let mut ctx = temp_context(&dir);

    ctx.route_invoice(&parsed("acme", "INV-600", 99_000, 1.0))
        .expect("route");
    ctx.record_payment("acme", "INV-600", ach_payment(99_000))
        .expect("pay");

    // Simulate a crash after archiving but before the active record
    // was removed: put the paid copy back into the active tree.
    let config = temp_config(&dir);
    let active = config.paths.state_dir.join("acme").join("INV-600.json");
    let archived = config
        .paths
        .state_dir
        .join("archive")
        .join("acme")
        .join("INV-600.json");
    std::fs::copy(&archived, &active).expect("restore active copy");

    // The shadowed active copy is invisible to scans, so totals and
    // the ledger still agree.
    let snapshot = ctx.snapshot().expect("snapshot");
    assert_eq!(snapshot.active_counts["paid"], 0);
    assert!(ctx.inspect_consistency().expect("inspect").consistent);

    // Retrying the payment cleans up and stays idempotent.
    let retried = ctx
        .record_payment("acme", "INV-600", ach_payment(99_000))
        .expect("retry");
    assert_eq!(retried.status, InvoiceStatus::Paid);
    assert!(!active.exists(), "retry removes the lingering active copy");
    assert!(ctx.check_consistency().expect("consistency").consistent);

    // The duplicate notification was absorbed by producer dedupe.
    let emailer = ctx.queue("emailer").expect("emailer queue");
    assert_eq!(emailer.pending().expect("pending").messages.len(), 1);
}

// ============================================================================
// Supervision
// ============================================================================

#[test]
fn test_unresponsive_agent_restarts_then_escalates_once() {
    let dir = TempDir::new().expect("tempdir");
    let config = temp_config(&dir);
    let messages: Recorded = Arc::new(Mutex::new(Vec::new()));
    let requests: Recorded = Arc::new(Mutex::new(Vec::new()));
    let mut ctx = CollectionsContext::with_collaborators(
        config,
        Box::new(RecordingNotifier(Arc::clone(&messages))),
        Box::new(RecordingControl(Arc::clone(&requests))),
    )
    .expect("context");

    let heartbeat_dir = ctx.config().paths.heartbeat_dir.clone();
    write_heartbeat(&heartbeat_dir, "payment_watcher", 1).expect("heartbeat");

    // email_parser never writes a heartbeat. Two stale checks request
    // restarts; the third escalates.
    for _ in 0..2 {
        let health = ctx.check_heartbeats().expect("check");
        let parser = health
            .iter()
            .find(|h| h.agent == "email_parser")
            .expect("tracked");
        assert_eq!(parser.state, AgentState::Restarting);
        let watcher = health
            .iter()
            .find(|h| h.agent == "payment_watcher")
            .expect("tracked");
        assert_eq!(watcher.state, AgentState::Healthy);
    }
    assert_eq!(requests.lock().expect("lock").len(), 2);
    assert!(messages.lock().expect("lock").is_empty());

    let health = ctx.check_heartbeats().expect("check");
    let parser = health
        .iter()
        .find(|h| h.agent == "email_parser")
        .expect("tracked");
    assert_eq!(parser.state, AgentState::Escalated);
    assert_eq!(messages.lock().expect("lock").len(), 1);
    assert!(messages.lock().expect("lock")[0].contains("email_parser"));

    // Further stale checks stay escalated without repeating the page.
    ctx.check_heartbeats().expect("check");
    assert_eq!(messages.lock().expect("lock").len(), 1);

    // Recovery re-arms the notification for the next episode.
    write_heartbeat(&heartbeat_dir, "email_parser", 7).expect("heartbeat");
    let health = ctx.check_heartbeats().expect("check");
    let parser = health
        .iter()
        .find(|h| h.agent == "email_parser")
        .expect("tracked");
    assert_eq!(parser.state, AgentState::Healthy);

    let snapshot = ctx.snapshot().expect("snapshot");
    assert_eq!(snapshot.agents.len(), 2);
}
