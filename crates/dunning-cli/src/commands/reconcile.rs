//! `dunning reconcile` - compare store totals against the ledger.
//!
//! One raw reconciliation pass plus queue depth checks, printed as a
//! report. Nothing is modified; discrepancies are for an operator to
//! repair.
//!
//! # Exit Codes
//!
//! - 0: Totals agree and every queue is below its ceiling
//! - 1: The pass itself failed
//! - 2: At least one discrepancy or overfull queue

use std::path::Path;

use clap::Args;
use dunning_core::money;

use super::exit_codes;

/// Reconcile command arguments.
#[derive(Debug, Args)]
pub struct ReconcileArgs {
    /// Print the full report as JSON.
    #[arg(long)]
    pub json: bool,
}

pub fn run(config_path: &Path, args: &ReconcileArgs) -> u8 {
    match run_inner(config_path, args) {
        Ok(consistent) => {
            if consistent {
                exit_codes::SUCCESS
            } else {
                exit_codes::UNHEALTHY
            }
        },
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_codes::ERROR
        },
    }
}

fn run_inner(config_path: &Path, args: &ReconcileArgs) -> anyhow::Result<bool> {
    let ctx = super::load_context(config_path)?;
    let report = ctx.inspect_consistency()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(report.consistent);
    }

    for (status, store_total) in &report.store_totals_cents {
        let ledger_total = report.ledger_totals_cents.get(status);
        match ledger_total {
            Some(ledger_total) => println!(
                "{status}: store {} / ledger {}",
                money::format_cents(*store_total),
                money::format_cents(*ledger_total)
            ),
            None => println!(
                "{status}: store {} (not ledgered)",
                money::format_cents(*store_total)
            ),
        }
    }
    for queue in &report.queue_depths {
        println!(
            "queue {}: depth {} (ceiling {})",
            queue.queue, queue.depth, queue.ceiling
        );
    }
    if report.consistent {
        println!("consistent");
    } else {
        for discrepancy in &report.discrepancies {
            println!(
                "DISCREPANCY {}: store {} vs ledger {} (delta {})",
                discrepancy.status,
                money::format_cents(discrepancy.store_total_cents),
                money::format_cents(discrepancy.ledger_total_cents),
                money::format_cents(discrepancy.delta_cents)
            );
        }
        for queue in report.queue_depths.iter().filter(|q| !q.healthy) {
            println!(
                "DISCREPANCY queue {}: depth {} at or above ceiling {}",
                queue.queue, queue.depth, queue.ceiling
            );
        }
    }
    Ok(report.consistent)
}
