// admissiond - Admission control daemon
//
// Runs endpoint rate limiting and hourly quotas in front of a demo
// application, and offers config inspection commands.

use admission_control::config::Config;
use admission_control::rate_limit::{AdmissionManager, StatsReporter};
use admission_control::server;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// admissiond: per-endpoint rate limits and per-identity hourly quotas
#[derive(Parser, Debug)]
#[command(name = "admissiond")]
#[command(author = "LuminaGuard Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Admission control for HTTP APIs", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the demo application behind the admission layer
    Serve {
        /// Configuration file (default: $ADMISSION_CONFIG or ./admission.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Listen address, overrides the configuration
        #[arg(long)]
        bind: Option<String>,
    },
    /// Load and validate a configuration file
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the public rule list as JSON
    Rules {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            Config::load_from_path(path)
        }
        None => Config::load(),
    }
}

fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { config.log_level()? };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    match args.command {
        Some(Commands::Serve { config, bind }) => {
            let mut config = load_config(config.as_deref())?;
            if let Some(bind) = bind {
                config.server.bind = bind;
                config.bind_addr()?;
            }
            init_tracing(&config, args.verbose)?;
            info!("admissiond v0.1.0 starting...");
            server::serve(config).await?;
        }
        Some(Commands::CheckConfig { config }) => {
            let config = load_config(config.as_deref())?;
            println!(
                "Configuration OK: {} rules, {} roles, {} expensive endpoints, failure policy {:?}",
                config.admission.rules.len(),
                config.admission.roles.len(),
                config.admission.expensive_endpoints.len(),
                config.admission.failure_policy
            );
        }
        Some(Commands::Rules { config }) => {
            let config = load_config(config.as_deref())?;
            let manager = AdmissionManager::new(config.admission.clone());
            let stats = StatsReporter::new(manager, config.admission.stats_snapshot_ttl());
            let limits = stats.public_limits().await;
            let json = serde_json::to_string_pretty(&limits).context("Failed to encode rules")?;
            println!("{}", json);
        }
        None => {
            println!("No command specified. Use \"admissiond --help\" for usage.");
        }
    }

    Ok(())
}
