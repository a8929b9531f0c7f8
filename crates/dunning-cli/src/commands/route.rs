//! `dunning route` - land a parsed invoice in the system.
//!
//! Reads a parser's JSON output from a file (or stdin with `-`),
//! scores it, and routes it to automatic handling or an operator hold.
//!
//! # Exit Codes
//!
//! - 0: Invoice routed (any disposition)
//! - 1: Invalid input or a store/ledger failure

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, bail};
use clap::Args;
use dunning_core::routing::ParsedInvoice;

use super::exit_codes;

/// Parsed-invoice input larger than this is refused.
const MAX_INPUT_SIZE: u64 = 64 * 1024;

/// Route command arguments.
#[derive(Debug, Args)]
pub struct RouteArgs {
    /// Path to the parsed-invoice JSON, or `-` for stdin.
    #[arg(long)]
    pub input: String,

    /// Print the routing outcome as JSON.
    #[arg(long)]
    pub json: bool,
}

pub fn run(config_path: &Path, args: &RouteArgs) -> u8 {
    match run_inner(config_path, args) {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_codes::ERROR
        },
    }
}

fn run_inner(config_path: &Path, args: &RouteArgs) -> anyhow::Result<()> {
    let invoice = read_invoice(&args.input)?;
    let ctx = super::load_context(config_path)?;
    let outcome = ctx.route_invoice(&invoice)?;

    if args.json {
        let output = serde_json::json!({
            "client": outcome.record.client,
            "invoice_id": outcome.record.invoice_id,
            "disposition": outcome.disposition.as_str(),
            "confidence": outcome.confidence,
            "status": outcome.record.status,
        });
        println!("{output}");
    } else {
        println!(
            "{}/{} -> {} (confidence {:.3})",
            outcome.record.client,
            outcome.record.invoice_id,
            outcome.disposition,
            outcome.confidence
        );
    }
    Ok(())
}

/// Read and parse the invoice JSON, bounded at [`MAX_INPUT_SIZE`].
fn read_invoice(input: &str) -> anyhow::Result<ParsedInvoice> {
    let content = if input == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .take(MAX_INPUT_SIZE + 1)
            .read_to_string(&mut buffer)
            .context("reading parsed invoice from stdin")?;
        buffer
    } else {
        let path = PathBuf::from(input);
        let metadata = std::fs::metadata(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        if metadata.len() > MAX_INPUT_SIZE {
            bail!(
                "parsed invoice file {} exceeds the {MAX_INPUT_SIZE}-byte limit",
                path.display()
            );
        }
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?
    };
    if content.len() as u64 > MAX_INPUT_SIZE {
        bail!("parsed invoice input exceeds the {MAX_INPUT_SIZE}-byte limit");
    }
    serde_json::from_str(&content).context("parsing invoice JSON")
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::commands::test_support::write_config;

    fn invoice_json(invoice_id: &str, confidence: f64) -> String {
        serde_json::json!({
            "client": "acme",
            "invoice_id": invoice_id,
            "amount_cents": 150_000,
            "due_date": "2026-04-30",
            "field_confidences": {
                "invoice_id": confidence,
                "amount": confidence,
                "due_date": confidence,
                "line_items": confidence,
            },
        })
        .to_string()
    }

    #[test]
    fn test_route_from_file_succeeds() {
        let dir = TempDir::new().expect("tempdir");
        let config = write_config(&dir);
        let input = dir.path().join("invoice.json");
        std::fs::write(&input, invoice_json("INV-100", 1.0)).expect("write input");

        let args = RouteArgs {
            input: input.display().to_string(),
            json: true,
        };
        assert_eq!(run(&config, &args), exit_codes::SUCCESS);
    }

    #[test]
    fn test_route_rejects_malformed_input() {
        let dir = TempDir::new().expect("tempdir");
        let config = write_config(&dir);
        let input = dir.path().join("invoice.json");
        std::fs::write(&input, "{not json").expect("write input");

        let args = RouteArgs {
            input: input.display().to_string(),
            json: false,
        };
        assert_eq!(run(&config, &args), exit_codes::ERROR);
    }

    #[test]
    fn test_route_rejects_missing_file() {
        let dir = TempDir::new().expect("tempdir");
        let config = write_config(&dir);
        let args = RouteArgs {
            input: dir.path().join("absent.json").display().to_string(),
            json: false,
        };
        assert_eq!(run(&config, &args), exit_codes::ERROR);
    }
}
