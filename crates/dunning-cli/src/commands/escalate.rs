//! `dunning escalate` - hand an unpaid invoice to collections.
//!
//! # Exit Codes
//!
//! - 0: Invoice escalated
//! - 1: Unknown invoice, invalid transition, or a write failure

use std::path::Path;

use clap::Args;
use dunning_core::money;

use super::exit_codes;

/// Escalate command arguments.
#[derive(Debug, Args)]
pub struct EscalateArgs {
    /// Client the invoice belongs to.
    pub client: String,

    /// Invoice id.
    pub invoice_id: String,

    /// Why the invoice is being escalated.
    #[arg(long)]
    pub reason: String,
}

pub fn run(config_path: &Path, args: &EscalateArgs) -> u8 {
    match run_inner(config_path, args) {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_codes::ERROR
        },
    }
}

fn run_inner(config_path: &Path, args: &EscalateArgs) -> anyhow::Result<()> {
    let ctx = super::load_context(config_path)?;
    let record = ctx.escalate_invoice(&args.client, &args.invoice_id, &args.reason)?;
    println!(
        "{}/{} escalated: {} ({})",
        record.client,
        record.invoice_id,
        money::format_cents(record.amount_cents),
        args.reason
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::commands::test_support::write_config;

    #[test]
    fn test_escalate_unknown_invoice_fails() {
        let dir = TempDir::new().expect("tempdir");
        let config = write_config(&dir);

        let args = EscalateArgs {
            client: "acme".to_string(),
            invoice_id: "INV-404".to_string(),
            reason: "unresponsive".to_string(),
        };
        assert_eq!(run(&config, &args), exit_codes::ERROR);
    }
}
