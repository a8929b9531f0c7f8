//! Point-in-time status snapshot for operator display.
//!
//! A [`SystemSnapshot`] bundles everything an operator asks "how are
//! we doing" about: active record counts and totals per status, the
//! archive, ledger section totals, agent health, and queue depths.
//! It is collected read-only and serializes to JSON for dashboards
//! and the status command.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::health::{AgentHealth, HeartbeatMonitor};
use crate::ledger::{Ledger, LedgerError, LedgerSection};
use crate::queue::{MessageQueue, QueueError};
use crate::record::InvoiceStatus;
use crate::store::{StateStore, StoreError};

/// Errors from snapshot collection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SnapshotError {
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

/// Depth of one queue at collection time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepthSnapshot {
    /// Consumer name.
    pub queue: String,
    /// Uncommitted messages.
    pub depth: u64,
}

/// Point-in-time view of the whole system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    /// When the snapshot was collected.
    pub generated_at: DateTime<Utc>,
    /// Active record counts per status.
    pub active_counts: BTreeMap<String, usize>,
    /// Active record totals in cents per status.
    pub active_totals_cents: BTreeMap<String, i64>,
    /// Records in the archive, paid and rejected alike.
    pub archived_count: usize,
    /// Total of archived paid records in cents.
    pub archived_paid_total_cents: i64,
    /// Ledger totals in cents per section.
    pub ledger_totals_cents: BTreeMap<String, i64>,
    /// Last known health of every tracked agent.
    pub agents: Vec<AgentHealth>,
    /// Depth of every queue.
    pub queues: Vec<QueueDepthSnapshot>,
}

impl SystemSnapshot {
    /// Collect a snapshot from the live components. The monitor is
    /// read as-is; no heartbeat checks run here.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] if the store, ledger, or a queue
    /// cannot be read.
    pub fn collect(
        store: &StateStore,
        ledger: &Ledger,
        monitor: &HeartbeatMonitor,
        queues: &[MessageQueue],
    ) -> Result<Self, SnapshotError> {
        let mut active_counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut active_totals: BTreeMap<String, i64> = BTreeMap::new();
        for status in InvoiceStatus::ALL {
            active_counts.insert(status.as_str().to_string(), 0);
            active_totals.insert(status.as_str().to_string(), 0);
        }
        for record in store.scan()? {
            let key = record.status.as_str().to_string();
            *active_counts.entry(key.clone()).or_insert(0) += 1;
            let total = active_totals.entry(key).or_insert(0);
            *total = total.saturating_add(record.amount_cents);
        }

        let mut archived_count = 0usize;
        let mut archived_paid_total = 0i64;
        for record in store.scan_archive()? {
            archived_count += 1;
            if record.status == InvoiceStatus::Paid {
                archived_paid_total = archived_paid_total.saturating_add(record.amount_cents);
            }
        }

        let doc = ledger.load()?;
        let mut ledger_totals: BTreeMap<String, i64> = BTreeMap::new();
        for section in LedgerSection::ALL {
            ledger_totals.insert(section.as_str().to_string(), doc.sum_section(section));
        }

        let mut queue_depths = Vec::with_capacity(queues.len());
        for queue in queues {
            queue_depths.push(QueueDepthSnapshot {
                queue: queue.consumer().to_string(),
                depth: queue.depth()?,
            });
        }

        Ok(Self {
            generated_at: Utc::now(),
            active_counts,
            active_totals_cents: active_totals,
            archived_count,
            archived_paid_total_cents: archived_paid_total,
            ledger_totals_cents: ledger_totals,
            agents: monitor.all_health(),
            queues: queue_depths,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::NaiveDate;
    use tempfile::TempDir;

    use super::*;
    use crate::config::HealthConfig;
    use crate::health::{RestartRequestLog, TracingNotifier};
    use crate::record::{InvoiceRecord, PaymentInfo};

    fn temp_monitor(dir: &TempDir, agents: Vec<String>) -> HeartbeatMonitor {
        let config = HealthConfig {
            heartbeat_timeout: Duration::from_secs(60 * 60),
            escalation_threshold: 2,
            history_window: 10,
            agents,
        };
        HeartbeatMonitor::new(
            dir.path().join("heartbeats"),
            &config,
            Box::new(TracingNotifier),
            Box::new(RestartRequestLog::new(
                dir.path().join("heartbeats").join("restart_requests.log"),
            )),
        )
    }

    fn record(invoice_id: &str, amount_cents: i64, status: InvoiceStatus) -> InvoiceRecord {
        InvoiceRecord::new(
            "acme",
            invoice_id,
            amount_cents,
            NaiveDate::from_ymd_opt(2026, 3, 15).expect("valid date"),
            status,
            0.99,
        )
    }

    #[test]
    fn test_empty_system_snapshot() {
        let dir = TempDir::new().expect("tempdir");
        let store = StateStore::open(dir.path().join("state")).expect("store");
        let ledger = Ledger::open(dir.path().join("ledger.md"), 1).expect("ledger");
        let monitor = temp_monitor(&dir, Vec::new());

        let snapshot = SystemSnapshot::collect(&store, &ledger, &monitor, &[]).expect("collect");
        assert_eq!(snapshot.active_counts.len(), 5);
        assert!(snapshot.active_counts.values().all(|&n| n == 0));
        assert_eq!(snapshot.archived_count, 0);
        assert_eq!(snapshot.archived_paid_total_cents, 0);
        assert!(snapshot.agents.is_empty());
        assert!(snapshot.queues.is_empty());
    }

    #[test]
    fn test_snapshot_counts_by_status() {
        let dir = TempDir::new().expect("tempdir");
        let store = StateStore::open(dir.path().join("state")).expect("store");
        let ledger = Ledger::open(dir.path().join("ledger.md"), 1).expect("ledger");
        let monitor = temp_monitor(&dir, vec!["email_parser".to_string()]);

        store
            .write(record("INV-1", 150_000, InvoiceStatus::Unpaid))
            .expect("write");
        store
            .write(record("INV-2", 32_000, InvoiceStatus::Unpaid))
            .expect("write");
        store
            .write(record("INV-3", 8_050, InvoiceStatus::Review))
            .expect("write");
        store
            .mark_paid(
                "acme",
                "INV-2",
                PaymentInfo {
                    method: "wire".to_string(),
                    paid_at: Utc::now(),
                    amount_cents: 32_000,
                    source_reference: None,
                },
            )
            .expect("mark paid");

        let snapshot = SystemSnapshot::collect(&store, &ledger, &monitor, &[]).expect("collect");
        assert_eq!(snapshot.active_counts["unpaid"], 1);
        assert_eq!(snapshot.active_counts["review"], 1);
        assert_eq!(snapshot.active_counts["paid"], 0, "paid records archive");
        assert_eq!(snapshot.active_totals_cents["unpaid"], 150_000);
        assert_eq!(snapshot.archived_count, 1);
        assert_eq!(snapshot.archived_paid_total_cents, 32_000);
        assert_eq!(snapshot.agents.len(), 1);
        assert_eq!(snapshot.agents[0].agent, "email_parser");
    }

    #[test]
    fn test_snapshot_includes_queue_depths() {
        let dir = TempDir::new().expect("tempdir");
        let store = StateStore::open(dir.path().join("state")).expect("store");
        let ledger = Ledger::open(dir.path().join("ledger.md"), 1).expect("ledger");
        let monitor = temp_monitor(&dir, Vec::new());
        let queue = MessageQueue::open(
            dir.path().join("queues"),
            "emailer",
            Duration::from_secs(60 * 60),
        )
        .expect("queue");
        queue
            .send(&crate::queue::QueueMessage::new(
                "payment_received",
                "acme",
                "INV-1",
                serde_json::json!({}),
            ))
            .expect("send");

        let snapshot =
            SystemSnapshot::collect(&store, &ledger, &monitor, std::slice::from_ref(&queue))
                .expect("collect");
        assert_eq!(snapshot.queues.len(), 1);
        assert_eq!(snapshot.queues[0].queue, "emailer");
        assert_eq!(snapshot.queues[0].depth, 1);
    }

    #[test]
    fn test_snapshot_round_trips_through_json() {
        let dir = TempDir::new().expect("tempdir");
        let store = StateStore::open(dir.path().join("state")).expect("store");
        let ledger = Ledger::open(dir.path().join("ledger.md"), 1).expect("ledger");
        let monitor = temp_monitor(&dir, vec!["payment_watcher".to_string()]);

        let snapshot = SystemSnapshot::collect(&store, &ledger, &monitor, &[]).expect("collect");
        let json = serde_json::to_string_pretty(&snapshot).expect("serialize");
        let parsed: SystemSnapshot = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed, snapshot);
    }
}
