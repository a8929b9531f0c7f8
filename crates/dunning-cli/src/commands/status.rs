//! `dunning status` - point-in-time snapshot of the whole system.
//!
//! # Exit Codes
//!
//! - 0: Snapshot collected
//! - 1: Snapshot failed

use std::path::Path;

use clap::Args;
use dunning_core::money;

use super::exit_codes;

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Print the snapshot as JSON.
    #[arg(long)]
    pub json: bool,
}

pub fn run(config_path: &Path, args: &StatusArgs) -> u8 {
    match run_inner(config_path, args) {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_codes::ERROR
        },
    }
}

fn run_inner(config_path: &Path, args: &StatusArgs) -> anyhow::Result<()> {
    let ctx = super::load_context(config_path)?;
    let snapshot = ctx.snapshot()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!("generated {}", snapshot.generated_at.to_rfc3339());
    println!("active records:");
    for (status, count) in &snapshot.active_counts {
        let total = snapshot.active_totals_cents.get(status).copied().unwrap_or(0);
        println!("  {status}: {count} ({})", money::format_cents(total));
    }
    println!(
        "archive: {} records, {} paid",
        snapshot.archived_count,
        money::format_cents(snapshot.archived_paid_total_cents)
    );
    println!("ledger:");
    for (section, total) in &snapshot.ledger_totals_cents {
        println!("  {section}: {}", money::format_cents(*total));
    }
    if snapshot.agents.is_empty() {
        println!("agents: none tracked");
    } else {
        println!("agents:");
        for agent in &snapshot.agents {
            println!("  {}: {}", agent.agent, agent.state.as_str());
        }
    }
    for queue in &snapshot.queues {
        println!("queue {}: {} pending", queue.queue, queue.depth);
    }
    Ok(())
}
