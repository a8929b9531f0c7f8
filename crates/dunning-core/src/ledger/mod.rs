//! Human-readable financial ledger.
//!
//! The ledger is a markdown file an operator can open in any editor:
//! a title line, one `##` section per financial bucket, and one entry
//! line per invoice. The suite treats it as structured data: every
//! mutation parses the whole document, edits the in-memory model, and
//! rewrites the file atomically. Nothing ever appends raw text.
//!
//! # File Format
//!
//! ```text
//! # Collections Ledger
//!
//! ## Unpaid
//! INV-100: 1500.00 (acme)
//! INV-204: 80.50 (zenith)
//!
//! ## Paid
//! INV-077: 320.00 (acme)
//!
//! ## Escalated
//! ```
//!
//! # Invariants
//!
//! - [INV-LGR-001] Parsing is fail-closed: a line that is neither a
//!   known header nor a well-formed entry is an error, never silently
//!   skipped. A hand-edit typo must surface, not vanish money.
//! - [INV-LGR-002] An invoice id appears in at most one section.
//! - [INV-LGR-003] `parse(render(doc))` reproduces `doc` exactly.

mod document;
mod file;


pub use document::{LEDGER_TITLE, LedgerDocument, LedgerEntry, LedgerError, LedgerSection};
pub use file::Ledger;
