//! `dunning watch` - the supervision loop.
//!
//! Checks every tracked agent's heartbeat once per interval,
//! restarting or escalating stale ones, and runs the debounced
//! consistency check every second tick (a finding must survive two
//! passes before it is reported, so back-to-back passes would defeat
//! the debounce). Runs until SIGINT or SIGTERM.
//!
//! # Exit Codes
//!
//! - 0: Interrupted cleanly
//! - 1: Invalid interval or a check failure

use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, bail};
use clap::Args;
use dunning_core::context::CollectionsContext;
use dunning_core::health::AgentState;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

use super::exit_codes;

/// Watch command arguments.
#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Time between heartbeat checks, e.g. `30s` or `5m`.
    #[arg(long, default_value = "30s")]
    pub interval: String,
}

pub fn run(config_path: &Path, args: &WatchArgs) -> u8 {
    match run_inner(config_path, args) {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_codes::ERROR
        },
    }
}

fn run_inner(config_path: &Path, args: &WatchArgs) -> anyhow::Result<()> {
    let period = humantime::parse_duration(&args.interval)
        .with_context(|| format!("parsing --interval {:?}", args.interval))?;
    if period.is_zero() {
        bail!("--interval must be positive");
    }

    let mut ctx = super::load_context(config_path)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    runtime.block_on(supervise(&mut ctx, period))
}

async fn supervise(ctx: &mut CollectionsContext, period: Duration) -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(
        period = %humantime::format_duration(period),
        "supervision loop started"
    );
    let mut cycle: u64 = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                cycle += 1;
                let agents = ctx.check_heartbeats()?;
                let unhealthy = agents
                    .iter()
                    .filter(|a| a.state != AgentState::Healthy)
                    .count();
                if unhealthy > 0 {
                    warn!(unhealthy, cycle, "agents not healthy");
                }
                if cycle % 2 == 0 {
                    let report = ctx.check_consistency()?;
                    if !report.consistent {
                        warn!(
                            discrepancies = report.discrepancies.len(),
                            cycle,
                            "consistency findings confirmed"
                        );
                    }
                }
            }
            _ = &mut ctrl_c => {
                info!("received ctrl-c, stopping");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, stopping");
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::commands::test_support::write_config;

    #[test]
    fn test_zero_interval_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let config = write_config(&dir);
        let args = WatchArgs {
            interval: "0s".to_string(),
        };
        assert_eq!(run(&config, &args), exit_codes::ERROR);
    }

    #[test]
    fn test_unparseable_interval_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let config = write_config(&dir);
        let args = WatchArgs {
            interval: "soon".to_string(),
        };
        assert_eq!(run(&config, &args), exit_codes::ERROR);
    }
}
