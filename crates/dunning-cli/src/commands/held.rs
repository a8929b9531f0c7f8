//! `dunning held` - inspect and resolve invoices awaiting an operator.
//!
//! Held invoices (review or manual) sit in the store with no ledger
//! entry until someone promotes them into the unpaid pipeline or
//! rejects them into the archive.
//!
//! # Exit Codes
//!
//! - 0: Command completed
//! - 1: Unknown invoice, record not held, or a write failure

use std::path::Path;

use clap::Subcommand;
use dunning_core::money;

use super::exit_codes;

/// Held-invoice subcommands.
#[derive(Debug, Subcommand)]
pub enum HeldCommand {
    /// List held invoices awaiting operator action
    List {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Promote a held invoice into the unpaid pipeline
    Promote {
        /// Client the invoice belongs to.
        client: String,
        /// Invoice id.
        invoice_id: String,
    },

    /// Reject a held invoice into the archive
    Reject {
        /// Client the invoice belongs to.
        client: String,
        /// Invoice id.
        invoice_id: String,
        /// Why the invoice is rejected.
        #[arg(long)]
        reason: String,
    },
}

pub fn run(config_path: &Path, command: &HeldCommand) -> u8 {
    match run_inner(config_path, command) {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_codes::ERROR
        },
    }
}

fn run_inner(config_path: &Path, command: &HeldCommand) -> anyhow::Result<()> {
    let ctx = super::load_context(config_path)?;
    match command {
        HeldCommand::List { json } => {
            let held: Vec<_> = ctx
                .store()
                .scan()?
                .into_iter()
                .filter(|record| record.status.is_held())
                .collect();
            if *json {
                println!("{}", serde_json::to_string_pretty(&held)?);
            } else if held.is_empty() {
                println!("no held invoices");
            } else {
                for record in &held {
                    println!(
                        "{}/{}  {}  {}  due {}  confidence {:.3}",
                        record.client,
                        record.invoice_id,
                        record.status.as_str(),
                        money::format_cents(record.amount_cents),
                        record.due_date,
                        record.confidence
                    );
                }
            }
        },
        HeldCommand::Promote { client, invoice_id } => {
            let record = ctx.promote_held(client, invoice_id)?;
            println!(
                "{}/{} promoted to unpaid ({})",
                record.client,
                record.invoice_id,
                money::format_cents(record.amount_cents)
            );
        },
        HeldCommand::Reject {
            client,
            invoice_id,
            reason,
        } => {
            let record = ctx.reject_held(client, invoice_id, reason)?;
            println!(
                "{}/{} rejected to archive ({})",
                record.client, record.invoice_id, reason
            );
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::commands::test_support::write_config;

    #[test]
    fn test_list_empty_store_succeeds() {
        let dir = TempDir::new().expect("tempdir");
        let config = write_config(&dir);
        assert_eq!(
            run(&config, &HeldCommand::List { json: false }),
            exit_codes::SUCCESS
        );
    }

    #[test]
    fn test_promote_unknown_invoice_fails() {
        let dir = TempDir::new().expect("tempdir");
        let config = write_config(&dir);
        let command = HeldCommand::Promote {
            client: "acme".to_string(),
            invoice_id: "INV-404".to_string(),
        };
        assert_eq!(run(&config, &command), exit_codes::ERROR);
    }
}
