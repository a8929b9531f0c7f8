//! State and supervision core for the invoice-collections worker suite.
//!
//! A set of cooperating worker processes (an emailer, a payment watcher,
//! a supervisor) share on-disk state with no central lock manager. This
//! crate owns the pieces that keep that state trustworthy:
//!
//! - [`store`] — crash-safe, checksummed persistence of one invoice
//!   record per (client, invoice id), with an immutable archive.
//! - [`audit`] — append-only event log of every state mutation.
//! - [`ledger`] — human-auditable aggregate of records by status,
//!   independently reconciled against the store.
//! - [`routing`] — confidence-weighted disposition of parsed invoices
//!   into automatic, review, or manual handling.
//! - [`health`] — heartbeat-driven liveness supervision with restart
//!   delegation and operator escalation.
//! - [`consistency`] — periodic store/ledger/queue cross-checks.
//! - [`queue`] — the at-least-once file-backed channels the workers
//!   share.
//! - [`snapshot`] — a read-only aggregate view for the dashboard.
//! - [`config`] / [`context`] — process-scoped configuration and
//!   component wiring; nothing in this crate touches ambient globals.
//!
//! Correctness rests on two primitives: atomic replace for single-record
//! writes (readers observe a complete old or complete new value) and
//! append-only writes for logs and queues. Compound operations such as
//! marking an invoice paid are not atomic as a whole; they are idempotent
//! and safely retryable from any interruption point instead.

pub mod audit;
pub mod config;
pub mod consistency;
pub mod context;
pub mod health;
pub mod ledger;
pub mod money;
pub mod queue;
pub mod record;
pub mod routing;
pub mod snapshot;
pub mod store;

pub use config::{CollectionsConfig, ConfigError};
pub use consistency::{ConsistencyChecker, ReconciliationReport};
pub use context::{CollectionsContext, ContextError};
pub use health::{AgentHealth, AgentState, HeartbeatMonitor};
pub use ledger::{Ledger, LedgerEntry, LedgerSection};
pub use record::{InvoiceRecord, InvoiceStatus, PaymentInfo};
pub use routing::{ConfidenceRouter, Disposition, ParsedInvoice};
pub use snapshot::SystemSnapshot;
pub use store::{StateStore, StoreError};
