//! Command-line front end for the promotion engine.
//!
//! Checks step lists against the built-in step kinds and prints their
//! configuration schemas. Running promotions is left to the controller that
//! embeds the library.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use promoter::exit_codes;
use promoter::io::config::load_config;
use promoter::registry::Registry;
use promoter::validate::{ConfigCheck, load_steps, validate_steps};

#[derive(Parser)]
#[command(
    name = "promoter",
    version,
    about = "Validate and inspect promotion step lists"
)]
struct Cli {
    /// Engine configuration (TOML). Defaults apply when the file is missing.
    #[arg(long, global = true, default_value = "promoter.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check aliases, step kinds and step configs of a JSON step list.
    Validate {
        /// Path to a JSON array of steps.
        steps: PathBuf,
    },
    /// Print the JSON Schema of a step kind's config.
    Schema {
        /// Step kind, e.g. `argocd-update`.
        kind: String,
    },
}

fn main() {
    promoter::logging::init();
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(exit_codes::INVALID);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)
        .with_context(|| format!("load config {}", cli.config.display()))?;
    let registry = Registry::builtin(&config)?;
    match cli.command {
        Command::Validate { steps } => cmd_validate(&registry, &steps),
        Command::Schema { kind } => cmd_schema(&registry, &kind),
    }
}

fn cmd_validate(registry: &Registry, path: &Path) -> Result<()> {
    let steps = load_steps(path)?;
    let reports = validate_steps(registry, &steps)?;
    for report in reports {
        let config = match report.config {
            ConfigCheck::Valid => "valid",
            ConfigCheck::Deferred => "deferred (expressions)",
            ConfigCheck::Unchecked => "unchecked",
        };
        println!("{}\t{}\t{}\t{}", report.index, report.alias, report.kind, config);
    }
    Ok(())
}

fn cmd_schema(registry: &Registry, kind: &str) -> Result<()> {
    let registration = registry
        .promotion_step_runner(kind)
        .ok_or_else(|| anyhow!("unknown step kind {kind:?}"))?;
    let schema = registration
        .schema
        .as_ref()
        .ok_or_else(|| anyhow!("step kind {kind:?} has no config schema"))?;
    println!(
        "{}",
        serde_json::to_string_pretty(schema.raw()).context("serialize schema")?
    );
    Ok(())
}
