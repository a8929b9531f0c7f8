//! dunning - operator CLI for the invoice-collections core.
//!
//! Thin front end over `dunning-core`: every subcommand loads the
//! config file, builds a [`CollectionsContext`], performs one
//! operation, and exits with a precise code. The long-running
//! exception is `watch`, which drives the supervision loop until
//! interrupted.
//!
//! [`CollectionsContext`]: dunning_core::context::CollectionsContext

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// dunning - operator CLI for the invoice-collections core
#[derive(Parser, Debug)]
#[command(name = "dunning")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the collections configuration file
    #[arg(short, long, default_value = "collections.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Route a parsed invoice into the system
    Route(commands::route::RouteArgs),

    /// Record a payment against an invoice
    MarkPaid(commands::mark_paid::MarkPaidArgs),

    /// Escalate an overdue invoice
    Escalate(commands::escalate::EscalateArgs),

    /// Inspect and resolve held invoices
    #[command(subcommand)]
    Held(commands::held::HeldCommand),

    /// Check agent heartbeats and consistency once
    Health(commands::health::HealthArgs),

    /// Reconcile the store against the ledger
    Reconcile(commands::reconcile::ReconcileArgs),

    /// Show a snapshot of the whole system
    Status(commands::status::StatusArgs),

    /// Run the supervision loop until interrupted
    Watch(commands::watch::WatchArgs),
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let code = match &cli.command {
        Commands::Route(args) => commands::route::run(&cli.config, args),
        Commands::MarkPaid(args) => commands::mark_paid::run(&cli.config, args),
        Commands::Escalate(args) => commands::escalate::run(&cli.config, args),
        Commands::Held(command) => commands::held::run(&cli.config, command),
        Commands::Health(args) => commands::health::run(&cli.config, args),
        Commands::Reconcile(args) => commands::reconcile::run(&cli.config, args),
        Commands::Status(args) => commands::status::run(&cli.config, args),
        Commands::Watch(args) => commands::watch::run(&cli.config, args),
    };
    std::process::exit(i32::from(code));
}
