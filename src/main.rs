//! Baskets CLI

use std::path::Path;
use std::process;

use anyhow::{Context, Result};
use baskets::config::ServerConfig;
use baskets::registry::Registry;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Baskets listed in the top lists of `stats`
const STATS_TOP: usize = 5;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!("Baskets v{}", env!("CARGO_PKG_VERSION"));
        eprintln!();
        eprintln!("Usage: baskets <command> <config.toml>");
        eprintln!();
        eprintln!("Commands:");
        eprintln!("  init     Open storage and create the configured baskets");
        eprintln!("  stats    Print basket statistics as JSON");
        process::exit(1);
    }

    let command = args[1].as_str();
    let config_path = Path::new(&args[2]);

    let result = match command {
        "init" => init(config_path),
        "stats" => stats(config_path),
        _ => {
            eprintln!("Unknown command: {command}");
            eprintln!("Run 'baskets' for usage information.");
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn open(config_path: &Path) -> Result<Registry> {
    let config = ServerConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    Registry::open(&config).context("opening basket storage")
}

fn init(config_path: &Path) -> Result<()> {
    let registry = open(config_path)?;
    info!(
        "Storage ready ({} backend, {} baskets)",
        registry.backend_kind(),
        registry.len()
    );
    Ok(())
}

fn stats(config_path: &Path) -> Result<()> {
    let registry = open(config_path)?;
    let stats = registry.stats(STATS_TOP)?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
