//! Operator subcommands.
//!
//! Every command function returns a process exit code from
//! [`exit_codes`] rather than a `Result`, so `main` can exit with a
//! precise code. Failures are printed to stderr by the command that
//! observed them.

use std::path::Path;

use anyhow::Context as _;
use dunning_core::config::CollectionsConfig;
use dunning_core::context::CollectionsContext;

pub mod escalate;
pub mod health;
pub mod held;
pub mod mark_paid;
pub mod reconcile;
pub mod route;
pub mod status;
pub mod watch;

/// Exit codes shared by every subcommand.
pub mod exit_codes {
    /// Command completed.
    pub const SUCCESS: u8 = 0;
    /// Command failed.
    pub const ERROR: u8 = 1;
    /// Command completed and found the system unhealthy or
    /// inconsistent.
    pub const UNHEALTHY: u8 = 2;
}

/// Load the config file and wire a full context from it.
pub fn load_context(config_path: &Path) -> anyhow::Result<CollectionsContext> {
    let config = CollectionsConfig::from_file(config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    Ok(CollectionsContext::new(config)?)
}
