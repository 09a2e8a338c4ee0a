//! Chunkway CLI - chunked uploads with bounded concurrency
//!
//! Uploads local files to a directory endpoint in fixed-size chunks, one
//! session channel per file, printing per-file progress.
//!
//! ## Quick Start
//!
//! ```bash
//! # Upload files into ./uploads
//! chunkway upload ./video.mp4 ./notes.txt
//!
//! # Smaller chunks, two files at a time, resized images
//! chunkway upload ./photos/*.jpg --chunk-size 16000 --max-concurrency 2 --resize 800x600
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

use anyhow::Result;
use clap::Parser;

mod commands;
pub mod ui;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Upload(args) => commands::upload::run(args).await,
        Command::Refs(args) => commands::refs::run(args).await,
        Command::Config(args) => commands::config::run(args).await,
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,chunkway=info,chunkway_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
