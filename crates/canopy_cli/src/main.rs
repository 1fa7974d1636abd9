//! canopy CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: Validation failure, invalid policy or any other error
//! - 2: Missing context
//! - 3: Cyclic reference
//! - 4: Unknown environment

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use canopy_core::config::ENV_DEBUG;
use commands::{exit_code_for, Cli, Commands};

/// `canopy=info,warn`, or `canopy=debug,warn` when `DEBUG` is set.
fn log_filter() -> EnvFilter {
    let directives = if std::env::var_os(ENV_DEBUG).is_some() {
        ["canopy=debug", "warn"]
    } else {
        ["canopy=info", "warn"]
    };
    directives
        .iter()
        .filter_map(|d| d.parse().ok())
        .fold(EnvFilter::from_default_env(), EnvFilter::add_directive)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    let log_result = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(log_filter())
        .try_init();

    if log_result.is_err() {
        // Logging already initialized, continue
    }

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Synthesize(args) => commands::synthesize::execute(args, cli.quiet).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ Error: {:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}
