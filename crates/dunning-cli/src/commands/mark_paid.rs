//! `dunning mark-paid` - record a payment against an invoice.
//!
//! Archives the record, moves its ledger entry, and queues the
//! payment notification. Safe to retry: a payment already recorded is
//! reported as such and the notification is deduplicated.
//!
//! # Exit Codes
//!
//! - 0: Payment recorded (or already recorded)
//! - 1: Unknown invoice, invalid amount, or a write failure

use std::path::Path;

use anyhow::Context as _;
use chrono::Utc;
use clap::Args;
use dunning_core::money;
use dunning_core::record::PaymentInfo;

use super::exit_codes;

/// Mark-paid command arguments.
#[derive(Debug, Args)]
pub struct MarkPaidArgs {
    /// Client the invoice belongs to.
    pub client: String,

    /// Invoice id.
    pub invoice_id: String,

    /// Amount received, e.g. `1500.00` or `1,500.00`.
    #[arg(long)]
    pub amount: String,

    /// How the money arrived (ach, wire, check, ...).
    #[arg(long, default_value = "ach")]
    pub method: String,

    /// Bank statement or remittance reference.
    #[arg(long)]
    pub reference: Option<String>,
}

pub fn run(config_path: &Path, args: &MarkPaidArgs) -> u8 {
    match run_inner(config_path, args) {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_codes::ERROR
        },
    }
}

fn run_inner(config_path: &Path, args: &MarkPaidArgs) -> anyhow::Result<()> {
    let amount_cents = money::parse_cents(&args.amount)
        .with_context(|| format!("parsing --amount {:?}", args.amount))?;
    let ctx = super::load_context(config_path)?;

    let record = ctx.record_payment(
        &args.client,
        &args.invoice_id,
        PaymentInfo {
            method: args.method.clone(),
            paid_at: Utc::now(),
            amount_cents,
            source_reference: args.reference.clone(),
        },
    )?;

    println!(
        "{}/{} marked paid: {} via {}",
        record.client,
        record.invoice_id,
        money::format_cents(amount_cents),
        args.method
    );
    Ok(())
}
