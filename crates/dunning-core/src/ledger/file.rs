//! On-disk ledger handle: load-mutate-rewrite with atomic persistence.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::document::{LedgerDocument, LedgerEntry, LedgerError, LedgerSection};
use crate::consistency::{
    self, ConsistencyError, ReconcileOptions, ReconciliationReport,
};
use crate::store::StateStore;

/// Handle to the ledger file.
///
/// Every mutation is parse-edit-rewrite: the whole document is parsed,
/// the model mutated, and the file replaced atomically. The handle
/// also owns the cent tolerance used when its totals are compared
/// against the record store.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    tolerance_cents: i64,
}

impl Ledger {
    /// Open the ledger at `path`, creating an empty document if the
    /// file does not exist and validating it if it does.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the parent directory cannot be
    /// created, the file cannot be read or written, or existing
    /// content fails to parse.
    pub fn open(path: impl Into<PathBuf>, tolerance_cents: i64) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
        let ledger = Self {
            path,
            tolerance_cents,
        };
        match std::fs::read_to_string(&ledger.path) {
            Ok(content) => {
                // Validate eagerly so a hand-edit typo surfaces at
                // startup, not mid-mutation.
                LedgerDocument::parse(&content)?;
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                ledger.persist(&LedgerDocument::new())?;
                info!(path = %ledger.path.display(), "created empty ledger");
            },
            Err(e) => return Err(io_error(&ledger.path, e)),
        }
        Ok(ledger)
    }

    /// Path of the ledger file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cent tolerance applied when comparing totals against the store.
    #[must_use]
    pub const fn tolerance_cents(&self) -> i64 {
        self.tolerance_cents
    }

    /// Parse the current document.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on read or parse failure. A missing
    /// file loads as an empty document.
    pub fn load(&self) -> Result<LedgerDocument, LedgerError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => LedgerDocument::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LedgerDocument::new()),
            Err(e) => Err(io_error(&self.path, e)),
        }
    }

    fn persist(&self, doc: &LedgerDocument) -> Result<(), LedgerError> {
        let dir = self
            .path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let mut temp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| io_error(&dir, e))?;
        temp.as_file_mut()
            .write_all(doc.render().as_bytes())
            .map_err(|e| io_error(temp.path(), e))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| io_error(temp.path(), e))?;
        temp.persist(&self.path)
            .map_err(|e| io_error(&self.path, e.error))?;
        Ok(())
    }

    /// Add an entry to a section and rewrite the file.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::DuplicateEntry`] if the invoice already
    /// has an entry, or I/O and parse errors from the rewrite.
    pub fn add_entry(&self, section: LedgerSection, entry: LedgerEntry) -> Result<(), LedgerError> {
        let mut doc = self.load()?;
        debug!(invoice_id = %entry.invoice_id, %section, "adding ledger entry");
        doc.add_entry(section, entry)?;
        self.persist(&doc)
    }

    /// Move an invoice's entry between sections and rewrite the file.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::EntryNotFound`] if the source section
    /// has no entry for the invoice.
    pub fn move_entry(
        &self,
        invoice_id: &str,
        from: LedgerSection,
        to: LedgerSection,
    ) -> Result<(), LedgerError> {
        let mut doc = self.load()?;
        debug!(invoice_id, %from, %to, "moving ledger entry");
        doc.move_entry(invoice_id, from, to)?;
        self.persist(&doc)
    }

    /// Remove an invoice's entry and rewrite the file.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::EntryNotFound`] if the section has no
    /// entry for the invoice.
    pub fn remove_entry(
        &self,
        invoice_id: &str,
        section: LedgerSection,
    ) -> Result<LedgerEntry, LedgerError> {
        let mut doc = self.load()?;
        let entry = doc.remove_entry(invoice_id, section)?;
        self.persist(&doc)?;
        Ok(entry)
    }

    /// Entries of a section.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on read or parse failure.
    pub fn entries(&self, section: LedgerSection) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self.load()?.entries(section).to_vec())
    }

    /// Sum of a section's amounts in cents.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on read or parse failure.
    pub fn sum_section(&self, section: LedgerSection) -> Result<i64, LedgerError> {
        Ok(self.load()?.sum_section(section))
    }

    /// Compare ledger totals against the record store with default
    /// options.
    ///
    /// # Errors
    ///
    /// Returns [`ConsistencyError`] if either side cannot be read.
    pub fn reconcile(&self, store: &StateStore) -> Result<ReconciliationReport, ConsistencyError> {
        self.reconcile_with(store, &ReconcileOptions::default())
    }

    /// Compare ledger totals against the record store.
    ///
    /// # Errors
    ///
    /// Returns [`ConsistencyError`] if either side cannot be read.
    pub fn reconcile_with(
        &self,
        store: &StateStore,
        options: &ReconcileOptions,
    ) -> Result<ReconciliationReport, ConsistencyError> {
        consistency::compare_store_and_ledger(store, self, options)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> LedgerError {
    LedgerError::Io {
        path: path.display().to_string(),
        source,
    }
}
