//! CLI command definitions and handlers.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Load configuration with graceful fallback to defaults.
///
/// If the config file doesn't exist or can't be parsed, it falls back to defaults.
pub fn load_config() -> chunkway_core::config::Config {
    chunkway_core::config::Config::load().unwrap_or_default()
}

pub mod config;
pub mod refs;
pub mod upload;

/// Chunkway - chunked uploads with bounded concurrency
#[derive(Parser)]
#[command(name = "chunkway")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Upload files to the directory endpoint
    Upload(UploadArgs),

    /// Print the reference token of each file
    Refs(RefsArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for the upload command
#[derive(Parser)]
pub struct UploadArgs {
    /// Files to upload
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Destination directory
    #[arg(short, long)]
    pub dest: Option<PathBuf>,

    /// Chunk size in bytes
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// Maximum files transferring at once
    #[arg(long)]
    pub max_concurrency: Option<usize>,

    /// Delay between chunks in milliseconds
    #[arg(long, value_name = "MS")]
    pub latency: Option<u64>,

    /// Total bytes the destination accepts
    #[arg(long, value_name = "BYTES")]
    pub quota: Option<u64>,

    /// Resize images to fit WIDTHxHEIGHT before upload
    #[arg(long, value_name = "WxH", value_parser = crate::ui::parse_resize)]
    pub resize: Option<(u32, u32)>,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the refs command
#[derive(Parser)]
pub struct RefsArgs {
    /// Files to inspect
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config subcommand
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Get a configuration value
    Get {
        /// Configuration key
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Configuration key
        key: String,

        /// Value to set
        value: String,
    },

    /// Show all configuration
    Show,

    /// Print the configuration file path
    Path,

    /// Reset to defaults
    Reset,
}
