//! Command line and environment configuration.

use crate::relay::ReconnectConfig;
use clap::Parser;
use namespace_core::device::{ScoreError, ScoreWeights};
use namespace_core::engine::EngineConfig;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Parser, Debug, Clone)]
#[command(name = "namespace-daemon")]
#[command(about = "Device-spanning file namespace daemon")]
pub struct Args {
    /// Base URL of the file/device service
    #[arg(long, env = "NAMESPACE_API_URL")]
    pub api_url: String,

    /// WebSocket URL of the transfer relay
    #[arg(long, env = "NAMESPACE_RELAY_URL")]
    pub relay_url: String,

    /// Account name used for shared/cloud listings and relay frames
    #[arg(short, long, env = "NAMESPACE_USERNAME")]
    pub username: String,

    /// Directory watched for local changes (`~` is expanded)
    #[arg(short, long, env = "NAMESPACE_WATCH_ROOT", default_value = "~")]
    pub watch_root: String,

    /// Seconds between device and namespace refreshes
    #[arg(long, env = "NAMESPACE_POLL_SECS", default_value_t = 30)]
    pub poll_secs: u64,

    #[arg(long, env = "NAMESPACE_WEIGHT_CPU", default_value_t = 1.0)]
    pub weight_cpu: f64,

    #[arg(long, env = "NAMESPACE_WEIGHT_RAM", default_value_t = 1.0)]
    pub weight_ram: f64,

    #[arg(long, env = "NAMESPACE_WEIGHT_GPU", default_value_t = 0.5)]
    pub weight_gpu: f64,

    #[arg(long, env = "NAMESPACE_WEIGHT_DOWNLOAD", default_value_t = 1.0)]
    pub weight_download: f64,

    #[arg(long, env = "NAMESPACE_WEIGHT_UPLOAD", default_value_t = 1.0)]
    pub weight_upload: f64,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Username cannot be empty")]
    EmptyUsername,

    #[error("Poll interval must be at least one second")]
    InvalidPollInterval,

    #[error("Cannot expand '~': home directory unknown")]
    NoHomeDir,

    #[error("Invalid relay URL {0}: expected ws:// or wss://")]
    InvalidRelayUrl(String),

    #[error(transparent)]
    Weights(#[from] ScoreError),
}

/// Validated daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub relay_url: String,
    pub watch_root: PathBuf,
    pub poll_interval: Duration,
    pub engine: EngineConfig,
    pub reconnect: ReconnectConfig,
    pub verbose: bool,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let username = args.username.trim().to_string();
        if username.is_empty() {
            return Err(ConfigError::EmptyUsername);
        }
        if args.poll_secs == 0 {
            return Err(ConfigError::InvalidPollInterval);
        }
        if !args.relay_url.starts_with("ws://") && !args.relay_url.starts_with("wss://") {
            return Err(ConfigError::InvalidRelayUrl(args.relay_url));
        }

        let weights = ScoreWeights {
            cpu: args.weight_cpu,
            ram: args.weight_ram,
            gpu: args.weight_gpu,
            download_speed: args.weight_download,
            upload_speed: args.weight_upload,
            ..ScoreWeights::default()
        };
        weights.validate()?;

        let mut engine = EngineConfig::new(username);
        engine.weights = weights;

        Ok(Self {
            api_url: args.api_url,
            relay_url: args.relay_url,
            watch_root: expand_tilde(&args.watch_root)?,
            poll_interval: Duration::from_secs(args.poll_secs),
            engine,
            reconnect: ReconnectConfig::default(),
            verbose: args.verbose,
        })
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &str) -> Result<PathBuf, ConfigError> {
    if path == "~" {
        return dirs::home_dir().ok_or(ConfigError::NoHomeDir);
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return dirs::home_dir()
            .map(|home| home.join(rest))
            .ok_or(ConfigError::NoHomeDir);
    }
    Ok(PathBuf::from(path))
}
