//! Config command - manage configuration files

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use peephole_core::PeepholeConfig;
use peephole_core::config::{ConfigFile, sample_config};
use std::path::PathBuf;

/// Arguments for the config command
#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show the path to the config file
    Path,

    /// Show the effective configuration, environment overrides included
    Show,

    /// Generate a default config file
    Init {
        /// Force overwrite if file exists
        #[arg(short, long)]
        force: bool,
    },

    /// Print a sample configuration to stdout
    Sample,
}

/// Run config subcommand
pub async fn config(args: ConfigArgs, config_path: Option<PathBuf>) -> Result<()> {
    let path = config_path.clone().unwrap_or_else(ConfigFile::default_path);

    match args.command {
        ConfigCommand::Path => {
            println!("{}", path.display());
            if path.exists() {
                println!("(file exists)");
            } else {
                println!("(file does not exist)");
            }
        }
        ConfigCommand::Show => {
            if path.exists() {
                println!("Configuration file: {}\n", path.display());
            } else {
                println!("No configuration file found at: {}", path.display());
                println!("Using defaults. Create a config file with:");
                println!("  peephole config init\n");
            }

            let config = PeepholeConfig::load(config_path).context("Failed to load configuration")?;
            let timings = &config.timings;

            println!("[server]");
            println!("  port:       {}", config.server.port);
            println!("  data_dir:   {}", config.server.data_dir.display());
            println!("[preview]");
            println!("  device:     {}", config.preview.device);
            println!(
                "  format:     {}x{} @ {}fps",
                config.preview.width, config.preview.height, config.preview.fps
            );
            println!("[capture]");
            println!(
                "  binary:     {} -f {}",
                config.capture.binary, config.capture.input_format
            );
            println!("  mirror:     {}", config.capture.mirror);
            println!("  quality:    {}", config.capture.quality);
            println!("  gphoto2:    {}", config.capture.gphoto2);
            println!("[pipeline]");
            println!(
                "  watchdog:   every {:?}, stall after {:?}",
                timings.watchdog_interval, timings.stall_threshold
            );
            println!("  janitor:    every {:?}", timings.janitor_interval);
            println!("  keepalive:  every {:?}", timings.keepalive_interval);
            println!(
                "  swap:       grace {:?}, timeout {:?}",
                timings.swap_grace, timings.swap_timeout
            );

            let warnings = config.validate();
            if !warnings.is_empty() {
                println!();
                for warning in warnings {
                    println!("warning: {}", warning);
                }
            }
        }
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                println!("Configuration file already exists: {}", path.display());
                println!();
                println!("Use --force to overwrite, or edit the existing file.");
                return Ok(());
            }

            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent).context("Failed to create config directory")?;
                }
            }

            std::fs::write(&path, sample_config()).context("Failed to write config file")?;

            println!("Created configuration file: {}", path.display());
            println!();
            println!("Edit this file to change the default device, port or timings.");
        }
        ConfigCommand::Sample => {
            print!("{}", sample_config());
        }
    }

    Ok(())
}
