//! Devices command

use anyhow::{Context, Result};
use peephole_core::{PeepholeConfig, capture};
use std::path::PathBuf;

/// List available capture devices
pub async fn devices(config_path: Option<PathBuf>) -> Result<()> {
    let config = PeepholeConfig::load(config_path).context("Failed to load configuration")?;

    println!(
        "Peephole - Available Capture Devices ({})\n",
        config.capture.input_format
    );

    let devices = capture::list_devices(&config.capture)
        .await
        .context("Failed to list devices")?;

    if devices.is_empty() {
        println!("No video devices found.");
        println!(
            "\nNote: '{}' must support -list_devices for the '{}' input format.",
            config.capture.binary, config.capture.input_format
        );
        return Ok(());
    }

    println!("{:<8} {:<10} {}", "Index", "Device", "Name");
    println!("{}", "-".repeat(60));

    for device in devices {
        let marker = if device.device == config.preview.device {
            " (default)"
        } else {
            ""
        };
        println!(
            "{:<8} {:<10} {}{}",
            device.index,
            device.device,
            truncate(&device.name, 40),
            marker
        );
    }

    println!("\nSwitch with: curl -X POST localhost:{}/camera/switch -H 'Content-Type: application/json' -d '{{\"device\":\"1:none\"}}'",
        config.server.port);

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max - 3).collect();
        format!("{}...", head)
    }
}
