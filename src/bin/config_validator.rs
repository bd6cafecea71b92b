//! # Engine Configuration Validator
//!
//! Loads a configuration directory for one environment, validates it, and
//! prints the effective configuration with credentials masked. Exits
//! non-zero when loading or validation fails.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

use pipeline_engine::config::ConfigManager;

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate pipeline engine configuration")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Environment to validate (development, test, production)
    #[arg(short, long, default_value = "development")]
    environment: String,

    /// Configuration directory (default: config)
    #[arg(short, long, default_value = "config")]
    config_dir: PathBuf,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load, validate and print the effective configuration
    Validate,

    /// List environment override files
    Environments,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let _ = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let result = match cli.command {
        Some(Commands::Environments) => list_environments(&cli.config_dir),
        Some(Commands::Validate) | None => validate(&cli.config_dir, &cli.environment),
    };

    if let Err(e) = result {
        error!("Configuration validation failed: {e:#}");
        eprintln!("configuration invalid: {e:#}");
        process::exit(1);
    }
}

fn validate(config_dir: &Path, environment: &str) -> Result<()> {
    let manager = ConfigManager::load_from_directory_with_env(config_dir, environment)
        .with_context(|| format!("loading {} for '{environment}'", config_dir.display()))?;

    println!("environment: {}", manager.environment());
    println!("directory:   {}", manager.config_directory().display());
    println!(
        "{}",
        serde_json::to_string_pretty(&manager.debug_config()).context("rendering configuration")?
    );
    println!("configuration valid");
    Ok(())
}

fn list_environments(config_dir: &Path) -> Result<()> {
    let dir = config_dir.join("environments");
    let mut environments: Vec<String> = std::fs::read_dir(&dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let path = entry.path();
            (path.extension()? == "toml")
                .then(|| path.file_stem()?.to_str().map(str::to_string))
                .flatten()
        })
        .collect();
    environments.sort();
    for environment in environments {
        println!("{environment}");
    }
    Ok(())
}
