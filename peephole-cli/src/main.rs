//! Peephole CLI
//!
//! Live camera preview over HTTP.
//!
//! # Usage
//!
//! ```bash
//! # List capture devices
//! peephole devices
//!
//! # Serve the preview on port 5000
//! peephole serve --device 0:none
//!
//! # Write a default config file
//! peephole config init
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use peephole_core::PeepholeError;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Peephole - live camera preview over HTTP
#[derive(Parser)]
#[command(name = "peephole")]
#[command(version)]
#[command(about = "Live camera preview over HTTP as a multipart MJPEG stream", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (default: ~/.config/peephole/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the preview stream and camera API
    Serve(commands::ServeArgs),

    /// List available capture devices
    #[command(alias = "ls")]
    Devices,

    /// Manage the configuration file
    Config(commands::ConfigArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("peephole_core={}", level).parse()?)
                .add_directive(format!("peephole={}", level).parse()?),
        )
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Serve(args) => commands::serve(args, cli.config).await,
        Commands::Devices => commands::devices(cli.config).await,
        Commands::Config(args) => commands::config(args, cli.config).await,
    };

    if let Err(e) = &result {
        let hint = e
            .chain()
            .find_map(|cause| cause.downcast_ref::<PeepholeError>())
            .and_then(PeepholeError::user_hint);
        if let Some(hint) = hint {
            eprintln!("hint: {}", hint);
        }
    }

    result
}
