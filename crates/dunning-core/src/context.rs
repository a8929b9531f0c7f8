//! Shared runtime context wiring the whole system together.
//!
//! One [`CollectionsContext`] owns every component: config, store,
//! ledger, router, heartbeat monitor, consistency checker, and the
//! outbound queues. Agents and the operator CLI construct one from a
//! validated config and drive everything through it instead of
//! threading paths and handles around. Multi-component operations
//! (pay, escalate, promote) live here so store and ledger are always
//! updated together, in the order that keeps a crash recoverable.
//!
//! # Invariants
//!
//! - [INV-CTX-001] The store is mutated before the ledger; a crash
//!   between the two leaves a reconcilable discrepancy, never a lost
//!   record.
//! - [INV-CTX-002] Ledger entries that are already in the expected
//!   shape (missing on pay/escalate, present on promote) are
//!   tolerated and logged, so retries and reconciled ledgers do not
//!   fail the operation.

use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::config::{CollectionsConfig, ConfigError};
use crate::consistency::{ConsistencyChecker, ConsistencyError, ReconciliationReport};
use crate::health::{
    AgentHealth, HealthError, HeartbeatMonitor, OperatorNotifier, ProcessControl,
    RestartRequestLog, TracingNotifier,
};
use crate::ledger::{Ledger, LedgerEntry, LedgerError, LedgerSection};
use crate::queue::{MessageQueue, QueueError, QueueMessage};
use crate::record::{InvoiceRecord, PaymentInfo};
use crate::routing::{ConfidenceRouter, ParsedInvoice, RoutingError, RoutingOutcome};
use crate::snapshot::{SnapshotError, SystemSnapshot};
use crate::store::{StateStore, StoreError};

/// Filename of the restart request log inside the heartbeat
/// directory.
pub const RESTART_REQUEST_LOG_FILENAME: &str = "restart_requests.log";

/// Queue consumer that receives payment notifications.
pub const PAYMENT_NOTIFICATION_CONSUMER: &str = "emailer";

/// Message kind sent when a payment lands.
pub const PAYMENT_RECEIVED_KIND: &str = "payment_received";

/// Errors from context construction or a multi-component operation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ContextError {
    /// Config failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Ledger operation failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Queue operation failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Routing failed.
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// Heartbeat check failed.
    #[error(transparent)]
    Health(#[from] HealthError),

    /// Consistency pass failed.
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    /// Snapshot collection failed.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Every component of the running system, wired from one config.
#[derive(Debug)]
pub struct CollectionsContext {
    config: CollectionsConfig,
    store: StateStore,
    ledger: Ledger,
    router: ConfidenceRouter,
    monitor: HeartbeatMonitor,
    checker: ConsistencyChecker,
    queues: Vec<MessageQueue>,
}

impl CollectionsContext {
    /// Build a context with the default operator collaborators: a
    /// tracing notifier and a restart request log next to the
    /// heartbeats.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError`] if the config is invalid or any
    /// component directory cannot be prepared.
    pub fn new(config: CollectionsConfig) -> Result<Self, ContextError> {
        let restart_log = RestartRequestLog::new(
            config.paths.heartbeat_dir.join(RESTART_REQUEST_LOG_FILENAME),
        );
        Self::with_collaborators(config, Box::new(TracingNotifier), Box::new(restart_log))
    }

    /// Build a context with explicit notifier and process control,
    /// for embedding and for tests.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError`] if the config is invalid or any
    /// component directory cannot be prepared.
    pub fn with_collaborators(
        config: CollectionsConfig,
        notifier: Box<dyn OperatorNotifier>,
        control: Box<dyn ProcessControl>,
    ) -> Result<Self, ContextError> {
        config.validate()?;

        let store = StateStore::open(&config.paths.state_dir)?;
        let ledger = Ledger::open(
            &config.paths.ledger_file,
            config.consistency.tolerance_cents,
        )?;
        let router = ConfidenceRouter::new(&config.routing);
        let monitor = HeartbeatMonitor::new(
            &config.paths.heartbeat_dir,
            &config.health,
            notifier,
            control,
        );
        let checker = ConsistencyChecker::new(&config.consistency);

        let mut queues = Vec::with_capacity(config.queue.consumers.len());
        for consumer in &config.queue.consumers {
            queues.push(MessageQueue::open(
                &config.paths.queue_dir,
                consumer,
                config.queue.dedupe_window,
            )?);
        }

        info!(
            state_dir = %config.paths.state_dir.display(),
            queues = queues.len(),
            agents = config.health.agents.len(),
            "collections context ready"
        );
        Ok(Self {
            config,
            store,
            ledger,
            router,
            monitor,
            checker,
            queues,
        })
    }

    /// The validated configuration.
    #[must_use]
    pub const fn config(&self) -> &CollectionsConfig {
        &self.config
    }

    /// The invoice state store.
    #[must_use]
    pub const fn store(&self) -> &StateStore {
        &self.store
    }

    /// The human-readable ledger.
    #[must_use]
    pub const fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// The confidence router.
    #[must_use]
    pub const fn router(&self) -> &ConfidenceRouter {
        &self.router
    }

    /// The audit log (owned by the store).
    #[must_use]
    pub const fn audit(&self) -> &AuditLog {
        self.store.audit()
    }

    /// The heartbeat monitor.
    #[must_use]
    pub const fn monitor(&self) -> &HeartbeatMonitor {
        &self.monitor
    }

    /// All configured queues.
    #[must_use]
    pub fn queues(&self) -> &[MessageQueue] {
        &self.queues
    }

    /// The queue for one consumer, if configured.
    #[must_use]
    pub fn queue(&self, consumer: &str) -> Option<&MessageQueue> {
        self.queues.iter().find(|q| q.consumer() == consumer)
    }

    /// Score a parsed invoice and land it in the store (and, when
    /// auto-accepted, the ledger).
    ///
    /// # Errors
    ///
    /// Returns [`ContextError`] if a confidence is invalid or a write
    /// fails.
    pub fn route_invoice(&self, invoice: &ParsedInvoice) -> Result<RoutingOutcome, ContextError> {
        Ok(self.router.route(invoice, &self.store, &self.ledger)?)
    }

    /// Record a payment: archive the record, move its ledger entry to
    /// paid, and notify the payment notification queue.
    ///
    /// A missing unpaid ledger entry is tolerated with a warning.
    /// Notification is deduplicated by the queue, so retries do not
    /// double-send.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError`] if the record is missing, the
    /// transition is invalid, or a write fails.
    pub fn record_payment(
        &self,
        client: &str,
        invoice_id: &str,
        payment: PaymentInfo,
    ) -> Result<InvoiceRecord, ContextError> {
        let record = self.store.mark_paid(client, invoice_id, payment)?;

        match self
            .ledger
            .move_entry(invoice_id, LedgerSection::Unpaid, LedgerSection::Paid)
        {
            Ok(()) => {}
            Err(LedgerError::EntryNotFound { .. }) => {
                warn!(
                    %client,
                    %invoice_id,
                    "no unpaid ledger entry to move; reconciliation will flag the paid total"
                );
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(queue) = self.queue(PAYMENT_NOTIFICATION_CONSUMER) {
            let payload = record.payment.as_ref().map_or_else(
                || json!({}),
                |p| json!({"amount_cents": p.amount_cents, "method": p.method}),
            );
            queue.send(&QueueMessage::new(
                PAYMENT_RECEIVED_KIND,
                client,
                invoice_id,
                payload,
            ))?;
        }
        Ok(record)
    }

    /// Escalate an unpaid invoice and move its ledger entry. A
    /// missing unpaid ledger entry is tolerated with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError`] if the record is missing, held, or
    /// already terminal, or a write fails.
    pub fn escalate_invoice(
        &self,
        client: &str,
        invoice_id: &str,
        reason: &str,
    ) -> Result<InvoiceRecord, ContextError> {
        let record = self.store.escalate(client, invoice_id, reason)?;

        match self
            .ledger
            .move_entry(invoice_id, LedgerSection::Unpaid, LedgerSection::Escalated)
        {
            Ok(()) => {}
            Err(LedgerError::EntryNotFound { .. }) => {
                warn!(%client, %invoice_id, "no unpaid ledger entry to move on escalation");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(record)
    }

    /// Promote a held record to unpaid and enter it into the ledger.
    /// An entry already present (from a crashed earlier attempt) is
    /// tolerated with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError`] if the record is missing or not held,
    /// or a write fails.
    pub fn promote_held(
        &self,
        client: &str,
        invoice_id: &str,
    ) -> Result<InvoiceRecord, ContextError> {
        let record = self.store.promote(client, invoice_id)?;

        match self.ledger.add_entry(
            LedgerSection::Unpaid,
            LedgerEntry::new(invoice_id, record.amount_cents, client),
        ) {
            Ok(()) => {}
            Err(LedgerError::DuplicateEntry { .. }) => {
                warn!(%client, %invoice_id, "ledger entry already present on promotion");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(record)
    }

    /// Reject a held record into the archive. Held records have no
    /// ledger entry, so the ledger is untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError`] if the record is missing or not held,
    /// or a write fails.
    pub fn reject_held(
        &self,
        client: &str,
        invoice_id: &str,
        reason: &str,
    ) -> Result<InvoiceRecord, ContextError> {
        Ok(self.store.reject(client, invoice_id, reason)?)
    }

    /// Check every tracked agent's heartbeat once, restarting or
    /// escalating stale ones.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError`] if check history cannot be written.
    pub fn check_heartbeats(&mut self) -> Result<Vec<AgentHealth>, ContextError> {
        Ok(self.monitor.check_all()?)
    }

    /// One debounced consistency pass over store, ledger, and queues.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError`] if any side cannot be read.
    pub fn check_consistency(&mut self) -> Result<ReconciliationReport, ContextError> {
        Ok(self.checker.run(&self.store, &self.ledger, &self.queues)?)
    }

    /// One raw consistency pass, findings reported as observed.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError`] if any side cannot be read.
    pub fn inspect_consistency(&self) -> Result<ReconciliationReport, ContextError> {
        Ok(self.checker.inspect(&self.store, &self.ledger, &self.queues)?)
    }

    /// Collect a point-in-time status snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError`] if the store, ledger, or a queue
    /// cannot be read.
    pub fn snapshot(&self) -> Result<SystemSnapshot, ContextError> {
        Ok(SystemSnapshot::collect(
            &self.store,
            &self.ledger,
            &self.monitor,
            &self.queues,
        )?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
