//! CLI command definitions.

use clap::{Parser, Subcommand};

pub mod synthesize;

/// canopy - synthesize deployment templates from a construct tree
#[derive(Parser)]
#[command(name = "canopy")]
#[command(version, about = "canopy - synthesize deployment templates from a construct tree")]
#[command(long_about = r#"
canopy builds a tree of stacks and resource constructs from an app manifest
and synthesizes one deployment template per stack, plus an assembly manifest
describing environments, dependencies, exports and imports.

COMMANDS:
  synthesize    → Build the app and write the cloud assembly

ENVIRONMENT:
  ACCOUNT, REGION   default environment for stacks that do not name one
  CONTEXT_FILE      context cache (default .context-cache.json)
  DEBUG             verbose logging

EXIT CODES:
  0 - Success
  1 - Validation failure (also invalid policies and general errors)
  2 - Missing context
  3 - Cyclic reference
  4 - Unknown environment
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Synthesize an app manifest into a cloud assembly
    #[command(alias = "synth")]
    Synthesize(synthesize::SynthesizeArgs),
}

/// Exit code for a failed command, from the innermost canopy error.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(core) = err.downcast_ref::<canopy_core::CoreError>() {
        return core.exit_code();
    }
    if let Some(construct) = err.downcast_ref::<canopy_constructs::ConstructError>() {
        return construct.exit_code();
    }
    canopy_core::ErrorKind::ValidationFailure.exit_code()
}
