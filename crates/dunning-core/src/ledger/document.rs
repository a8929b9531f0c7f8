//! In-memory model of the ledger document: sections, entries, and the
//! fail-closed markdown parser.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::money;
use crate::record::InvoiceStatus;

/// Title line written to every ledger file.
pub const LEDGER_TITLE: &str = "# Collections Ledger";

/// Errors from ledger parsing and mutation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// I/O failure on the ledger file.
    #[error("ledger I/O error on {path}: {source}")]
    Io {
        /// Path the operation touched.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A line could not be understood as header, title, or entry.
    #[error("ledger parse error on line {line}: {reason}")]
    Parse {
        /// 1-based line number.
        line: usize,
        /// What was wrong.
        reason: String,
    },

    /// The invoice id already has an entry.
    #[error("invoice {invoice_id} already has a ledger entry in {section}")]
    DuplicateEntry {
        /// The duplicated invoice id.
        invoice_id: String,
        /// Section holding the existing entry.
        section: LedgerSection,
    },

    /// No entry for the invoice id in the named section.
    #[error("invoice {invoice_id} has no ledger entry in {section}")]
    EntryNotFound {
        /// The invoice id that was looked up.
        invoice_id: String,
        /// Section that was searched.
        section: LedgerSection,
    },
}

/// Financial buckets of the ledger, in file order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum LedgerSection {
    /// Money owed.
    Unpaid,
    /// Money received.
    Paid,
    /// Money in dispute or handed to collections.
    Escalated,
}

impl LedgerSection {
    /// All sections in file order.
    pub const ALL: [Self; 3] = [Self::Unpaid, Self::Paid, Self::Escalated];

    /// Lowercase name, as used in reports and dedupe keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unpaid => "unpaid",
            Self::Paid => "paid",
            Self::Escalated => "escalated",
        }
    }

    fn display_name(self) -> &'static str {
        match self {
            Self::Unpaid => "Unpaid",
            Self::Paid => "Paid",
            Self::Escalated => "Escalated",
        }
    }

    /// The markdown header line for this section.
    #[must_use]
    pub fn header(self) -> String {
        format!("## {}", self.display_name())
    }

    fn from_header(line: &str) -> Option<Self> {
        match line {
            "## Unpaid" => Some(Self::Unpaid),
            "## Paid" => Some(Self::Paid),
            "## Escalated" => Some(Self::Escalated),
            _ => None,
        }
    }

    /// Section tracking a record status, if the status is tracked.
    ///
    /// Held statuses have no ledger section; a held record is not yet
    /// money the business counts.
    #[must_use]
    pub const fn for_status(status: InvoiceStatus) -> Option<Self> {
        match status {
            InvoiceStatus::Unpaid => Some(Self::Unpaid),
            InvoiceStatus::Paid => Some(Self::Paid),
            InvoiceStatus::Escalated => Some(Self::Escalated),
            InvoiceStatus::Review | InvoiceStatus::Manual => None,
        }
    }
}

impl fmt::Display for LedgerSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One invoice line in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Invoice id, unique across the whole document.
    pub invoice_id: String,
    /// Amount in cents.
    pub amount_cents: i64,
    /// Owning client.
    pub client: String,
}

impl LedgerEntry {
    /// Create an entry.
    #[must_use]
    pub fn new(invoice_id: &str, amount_cents: i64, client: &str) -> Self {
        Self {
            invoice_id: invoice_id.to_string(),
            amount_cents,
            client: client.to_string(),
        }
    }

    /// Render the entry line, e.g. `INV-100: 1500.00 (acme)`.
    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "{}: {} ({})",
            self.invoice_id,
            money::format_cents(self.amount_cents),
            self.client
        )
    }
}

/// Parsed ledger document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerDocument {
    title: String,
    sections: BTreeMap<LedgerSection, Vec<LedgerEntry>>,
}

impl Default for LedgerDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerDocument {
    /// An empty document with the standard title and all sections.
    #[must_use]
    pub fn new() -> Self {
        let mut sections = BTreeMap::new();
        for section in LedgerSection::ALL {
            sections.insert(section, Vec::new());
        }
        Self {
            title: LEDGER_TITLE.to_string(),
            sections,
        }
    }

    /// Parse a ledger file, failing on any line that is not a title,
    /// a known section header, or a well-formed entry.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Parse`] for malformed content and
    /// [`LedgerError::DuplicateEntry`] if an invoice id appears
    /// twice.
    pub fn parse(content: &str) -> Result<Self, LedgerError> {
        let mut doc = Self::new();
        let mut current: Option<LedgerSection> = None;

        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim();
            let lineno = index + 1;
            if line.is_empty() {
                continue;
            }
            if let Some(section) = LedgerSection::from_header(line) {
                current = Some(section);
                continue;
            }
            if line.starts_with("## ") {
                return Err(LedgerError::Parse {
                    line: lineno,
                    reason: format!("unknown section header {line:?}"),
                });
            }
            if line.starts_with("# ") {
                if current.is_some() {
                    return Err(LedgerError::Parse {
                        line: lineno,
                        reason: "title line after sections".to_string(),
                    });
                }
                doc.title = line.to_string();
                continue;
            }

            let Some(section) = current else {
                return Err(LedgerError::Parse {
                    line: lineno,
                    reason: format!("entry before any section header: {line:?}"),
                });
            };
            let entry = parse_entry(line, lineno)?;
            doc.add_entry(section, entry)?;
        }
        Ok(doc)
    }

    /// Render back to markdown. Output round-trips through
    /// [`LedgerDocument::parse`].
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.title);
        out.push('\n');
        for section in LedgerSection::ALL {
            out.push('\n');
            out.push_str(&section.header());
            out.push('\n');
            for entry in self.entries(section) {
                out.push_str(&entry.render());
                out.push('\n');
            }
        }
        out
    }

    /// Add an entry to a section.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::DuplicateEntry`] if the invoice id
    /// already has an entry anywhere in the document.
    pub fn add_entry(&mut self, section: LedgerSection, entry: LedgerEntry) -> Result<(), LedgerError> {
        if let Some((existing, _)) = self.find(&entry.invoice_id) {
            return Err(LedgerError::DuplicateEntry {
                invoice_id: entry.invoice_id,
                section: existing,
            });
        }
        self.sections.entry(section).or_default().push(entry);
        Ok(())
    }

    /// Move an invoice's entry between sections, keeping its amount
    /// and client.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::EntryNotFound`] if the source section
    /// has no entry for the invoice.
    pub fn move_entry(
        &mut self,
        invoice_id: &str,
        from: LedgerSection,
        to: LedgerSection,
    ) -> Result<(), LedgerError> {
        let entry = self.remove_entry(invoice_id, from)?;
        self.sections.entry(to).or_default().push(entry);
        Ok(())
    }

    /// Remove and return an invoice's entry from a section.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::EntryNotFound`] if the section has no
    /// entry for the invoice.
    pub fn remove_entry(
        &mut self,
        invoice_id: &str,
        section: LedgerSection,
    ) -> Result<LedgerEntry, LedgerError> {
        let entries = self.sections.entry(section).or_default();
        let position = entries
            .iter()
            .position(|e| e.invoice_id == invoice_id)
            .ok_or_else(|| LedgerError::EntryNotFound {
                invoice_id: invoice_id.to_string(),
                section,
            })?;
        Ok(entries.remove(position))
    }

    /// Entries of a section, in file order.
    #[must_use]
    pub fn entries(&self, section: LedgerSection) -> &[LedgerEntry] {
        self.sections.get(&section).map_or(&[], Vec::as_slice)
    }

    /// Sum of a section's amounts, saturating at the `i64` bounds.
    #[must_use]
    pub fn sum_section(&self, section: LedgerSection) -> i64 {
        self.entries(section)
            .iter()
            .fold(0_i64, |acc, e| acc.saturating_add(e.amount_cents))
    }

    /// Locate an invoice's entry, if any.
    #[must_use]
    pub fn find(&self, invoice_id: &str) -> Option<(LedgerSection, &LedgerEntry)> {
        for section in LedgerSection::ALL {
            if let Some(entry) = self
                .entries(section)
                .iter()
                .find(|e| e.invoice_id == invoice_id)
            {
                return Some((section, entry));
            }
        }
        None
    }

    /// Total number of entries across all sections.
    #[must_use]
    pub fn total_entries(&self) -> usize {
        LedgerSection::ALL
            .iter()
            .map(|s| self.entries(*s).len())
            .sum()
    }
}

/// Parse one `id: amount (client)` line.
fn parse_entry(line: &str, lineno: usize) -> Result<LedgerEntry, LedgerError> {
    let parse_err = |reason: String| LedgerError::Parse {
        line: lineno,
        reason,
    };

    let (id_part, rest) = line
        .split_once(':')
        .ok_or_else(|| parse_err(format!("entry missing `:` separator: {line:?}")))?;
    let invoice_id = id_part.trim();
    if invoice_id.is_empty() {
        return Err(parse_err("entry has an empty invoice id".to_string()));
    }

    let rest = rest.trim();
    let open = rest
        .rfind(" (")
        .ok_or_else(|| parse_err(format!("entry missing `(client)` suffix: {line:?}")))?;
    if !rest.ends_with(')') {
        return Err(parse_err(format!("entry missing closing paren: {line:?}")));
    }
    let amount_part = rest[..open].trim();
    let client = rest[open + 2..rest.len() - 1].trim();
    if client.is_empty() {
        return Err(parse_err("entry has an empty client".to_string()));
    }

    let amount_cents = money::parse_cents(amount_part)
        .map_err(|e| parse_err(format!("bad amount in entry: {e}")))?;
    Ok(LedgerEntry::new(invoice_id, amount_cents, client))
}
