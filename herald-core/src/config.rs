//! Configuration management for Herald
//!
//! Handles CLI argument parsing, config file loading, and defaults.

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default seconds between reprovide cycles (30 minutes)
const DEFAULT_REPROVIDE_INTERVAL_SECS: u64 = 30 * 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Parser, Debug)]
#[command(name = "herald")]
#[command(about = "Content announcement daemon for a storage node", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the announcement node
    Start(StartCommand),
}

#[derive(Parser, Debug, Clone)]
pub struct StartCommand {
    /// Load settings from a TOML config file; other flags are ignored
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Data directory for the datastore and block store
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Seconds between reprovide cycles (0 disables periodic reprovide)
    #[arg(long, default_value_t = DEFAULT_REPROVIDE_INTERVAL_SECS)]
    pub reprovide_interval: u64,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub reprovide_interval_secs: u64,
    pub log_level: String,
}

impl Config {
    /// Build config from CLI arguments, deferring to `--config <path>`
    /// when one is given.
    pub fn from_cli() -> Result<Self, ConfigError> {
        let cli = Cli::parse();

        match cli.command {
            Commands::Start(cmd) => match &cmd.config {
                Some(path) => Config::load_from_file(path),
                None => Ok(cmd.into()),
            },
        }
    }

    /// Load config from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("./data"),
            reprovide_interval_secs: DEFAULT_REPROVIDE_INTERVAL_SECS,
            log_level: "info".to_string(),
        }
    }
}

impl From<StartCommand> for Config {
    fn from(cmd: StartCommand) -> Self {
        Config {
            data_dir: cmd.data_dir,
            reprovide_interval_secs: cmd.reprovide_interval,
            log_level: cmd.log_level,
        }
    }
}
