pub mod commands;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] hometv_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session store error: {0}")]
    SessionStore(#[from] hometv_core::session::SessionStoreError),
    #[error("key store error: {0}")]
    KeyStore(#[from] hometv_core::access::KeyStoreError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid delivery mode: {0}")]
    DeliveryMode(String),
    #[error("channel catalog {0} has no channels")]
    EmptyCatalog(PathBuf),
    #[error("delivery secret {0} is empty")]
    EmptySecret(PathBuf),
    #[error("channel not found: {0}")]
    UnknownChannel(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "HomeTV live channel delivery daemon", long_about = None)]
pub struct Cli {
    /// Path to the main hometv.toml
    #[arg(long, default_value = "configs/hometv.toml")]
    pub config: PathBuf,
    /// Override for the channel catalog file
    #[arg(long)]
    pub channels_file: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the supervisor, session guard and delivery gateway
    Serve,
    /// Channel catalog operations
    #[command(subcommand)]
    Channels(ChannelCommands),
    /// Content key operations
    #[command(subcommand)]
    Keys(KeyCommands),
}

#[derive(Subcommand, Debug)]
pub enum ChannelCommands {
    /// List catalog channels
    List(ChannelListArgs),
}

#[derive(Args, Debug)]
pub struct ChannelListArgs {
    /// Only show channels in the desired active set
    #[arg(long, default_value_t = false)]
    pub active_only: bool,
}

#[derive(Subcommand, Debug)]
pub enum KeyCommands {
    /// Rotate a channel's content key
    Rotate(KeyRotateArgs),
}

#[derive(Args, Debug)]
pub struct KeyRotateArgs {
    /// Channel slug to rotate
    #[arg(long)]
    pub channel: String,
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = hometv_core::load_hometv_config(&cli.config)?;
    match &cli.command {
        Commands::Serve => commands::serve::run(&cli, config).await,
        Commands::Channels(command) => commands::channels::run(&cli, &config, command),
        Commands::Keys(command) => commands::keys::run(&cli, &config, command),
    }
}

pub(crate) fn channels_path(cli: &Cli, config: &hometv_core::HometvConfig) -> PathBuf {
    cli.channels_file
        .clone()
        .unwrap_or_else(|| config.resolve_path(&config.paths.channels_file))
}
