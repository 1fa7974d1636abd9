//! Synthesize command - Build an app manifest and write the cloud assembly.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use tracing::{info, warn};

use canopy_constructs::AppManifest;
use canopy_core::{synthesize, App, AppConfig, DirectorySink, TemplateSink, CONFIG_FILE};

#[derive(Args)]
pub struct SynthesizeArgs {
    /// App manifest (YAML or JSON) declaring stacks and constructs
    pub app_entry: PathBuf,

    /// Directory for the cloud assembly
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Context cache file
    #[arg(long, env = "CONTEXT_FILE")]
    pub context_file: Option<PathBuf>,

    /// Default account for stacks without one
    #[arg(long, env = "ACCOUNT")]
    pub account: Option<String>,

    /// Default region for stacks without one
    #[arg(long, env = "REGION")]
    pub region: Option<String>,

    /// Configuration file
    #[arg(short, long, default_value = CONFIG_FILE)]
    pub config: PathBuf,

    /// Print a JSON summary instead of a listing
    #[arg(long)]
    pub json: bool,
}

/// What a synthesis run produced.
#[derive(Debug, Serialize)]
pub struct SynthSummary {
    pub output_dir: PathBuf,
    pub stacks: Vec<String>,
    pub files: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

/// Configuration file, then environment, then command-line flags.
pub fn resolve_config(args: &SynthesizeArgs) -> Result<AppConfig> {
    let mut config = AppConfig::load_or_default(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?
        .with_env_overrides();
    if let Some(output) = &args.output {
        config.output_dir = output.clone();
    }
    if let Some(context_file) = &args.context_file {
        config.context_file = context_file.clone();
    }
    if let Some(account) = &args.account {
        config = config.with_account(account);
    }
    if let Some(region) = &args.region {
        config = config.with_region(region);
    }
    Ok(config)
}

pub async fn synthesize_app(config: AppConfig, entry: &Path) -> Result<SynthSummary> {
    let manifest = AppManifest::load(entry)
        .with_context(|| format!("Failed to read app manifest {}", entry.display()))?;
    let output_dir = config.output_dir.clone();

    let mut app = App::from_config(config)?;
    manifest.build(&mut app)?;
    let assembly = synthesize(&mut app)?;

    let warnings: Vec<String> = app
        .warnings()
        .into_iter()
        .map(|d| format!("{}: {}", d.path, d.message))
        .collect();
    for warning in &warnings {
        warn!("{}", warning);
    }

    let sink = DirectorySink::new(output_dir.clone());
    let files = sink.emit(&assembly).await?;
    info!(
        "Synthesized {} stack(s) into {}",
        assembly.stack_names().len(),
        output_dir.display()
    );

    Ok(SynthSummary {
        output_dir,
        stacks: assembly.stack_names().into_iter().map(String::from).collect(),
        files,
        warnings,
    })
}

pub async fn execute(args: SynthesizeArgs, quiet: bool) -> Result<()> {
    let config = resolve_config(&args)?;
    info!("Synthesizing {}", args.app_entry.display());

    let summary = synthesize_app(config, &args.app_entry).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    if quiet {
        return Ok(());
    }

    println!("✅ Synthesized {} stack(s)", summary.stacks.len());
    for stack in &summary.stacks {
        println!("   • {}", stack);
    }
    for warning in &summary.warnings {
        println!("   ⚠️  {}", warning);
    }
    println!("📁 Output: {}", summary.output_dir.display());
    Ok(())
}
