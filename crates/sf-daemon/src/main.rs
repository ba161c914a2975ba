//! subfleet: run and administer a fleet of chat bot instances.

mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sf_core::config::Config;
use sf_daemon::Daemon;
use sf_telemetry::logging::{self, LogFormat};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "subfleet", version, about)]
struct Cli {
    /// Config file (defaults to ~/.subfleet/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every enabled instance and supervise them until ctrl-c.
    Run,

    /// Register a new instance. The token is read from an environment variable.
    Register {
        /// Display name.
        #[arg(long)]
        name: String,
        /// Environment variable holding the bot token.
        #[arg(long, default_value = "SUBFLEET_BOT_TOKEN")]
        token_env: String,
        /// Channel id to join; repeat for several.
        #[arg(long = "channel")]
        channels: Vec<String>,
        /// Enable the assistant integration with this model.
        #[arg(long)]
        model: Option<String>,
        /// Messages per minute.
        #[arg(long)]
        rate_limit: Option<u32>,
    },

    /// List registered instances.
    List {
        #[arg(long)]
        json: bool,
    },

    /// Unregister an instance and delete its stored configuration.
    Remove { id: Uuid },

    /// Verify every stored credential; tampered ones are disabled.
    Audit,

    /// Repository statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let cfg = match path {
        Some(path) => Config::load_from(&path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config)?;

    let format = LogFormat::from_json_flag(config.general.log_json);
    if matches!(cli.command, Commands::Run) {
        logging::init("subfleet", &config.general.log_level, format);
    } else {
        // Administrative commands print their own output.
        logging::init("subfleet", "warn", format);
    }

    let daemon = Daemon::new(config).await?;

    match cli.command {
        Commands::Run => {
            daemon.run().await?;
        }
        Commands::Register {
            name,
            token_env,
            channels,
            model,
            rate_limit,
        } => {
            commands::register::run(&daemon, name, &token_env, channels, model, rate_limit).await?;
        }
        Commands::List { json } => commands::list::run(&daemon, json).await?,
        Commands::Remove { id } => commands::remove::run(&daemon, id).await?,
        Commands::Audit => commands::audit::run(&daemon).await?,
        Commands::Stats { json } => commands::stats::run(&daemon, json).await?,
    }

    Ok(())
}
