//! texd - LaTeX compilation service.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use texd_core::Config;

mod commands;
mod http;
mod settings;

use settings::ConfigArgs;

#[derive(Parser)]
#[command(name = "texd")]
#[command(about = "Compile LaTeX projects straight from git", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file; flags and environment override it
    #[arg(long, global = true, env = "TEXD_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text, env = "TEXD_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(flatten)]
    overrides: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve,
    /// Evict expired and least-recently-used cache entries
    Evict {
        /// Show what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },
    /// Remove job directories and staging directories left by a crash
    Sweep,
    /// Check that latexmk, git and pdftoppm are usable
    Check,
}

fn init_tracing(format: LogFormat, default_level: &str) {
    // Respects RUST_LOG (e.g. RUST_LOG=texd_core=debug)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&PathBuf>, overrides: ConfigArgs) -> Result<Config> {
    let mut config = match path {
        Some(p) => Config::load(p).with_context(|| format!("loading {}", p.display()))?,
        None => Config::default(),
    };
    overrides.apply(&mut config);
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve => "info",
        _ => "warn",
    };
    init_tracing(cli.log_format, default_level);

    let config = load_config(cli.config.as_ref(), cli.overrides)?;

    match cli.command {
        Commands::Serve => commands::serve::run(config).await,
        Commands::Evict { dry_run } => commands::evict::run(config, dry_run).await,
        Commands::Sweep => commands::sweep::run(config),
        Commands::Check => commands::check::run(config).await,
    }
}
