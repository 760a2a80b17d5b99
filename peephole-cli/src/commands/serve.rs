//! Serve command - run the preview server

use anyhow::{Context, Result};
use clap::Args;
use peephole_core::{
    PeepholeConfig, Supervisor,
    capture::FfmpegLauncher,
    server::{self, AppState},
    types::DeviceId,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

/// Arguments for the serve command
#[derive(Args)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Initial capture device (e.g., "0:none")
    #[arg(short, long)]
    device: Option<DeviceId>,

    /// Capture width
    #[arg(long)]
    width: Option<u32>,

    /// Capture height
    #[arg(long)]
    height: Option<u32>,

    /// Capture framerate
    #[arg(long)]
    fps: Option<u32>,

    /// Directory for still captures
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Do not mirror the preview
    #[arg(long)]
    no_mirror: bool,
}

impl ServeArgs {
    fn apply(self, config: &mut PeepholeConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(dir) = self.data_dir {
            config.server.data_dir = dir;
        }
        if let Some(device) = self.device {
            config.preview.device = device;
        }
        if let Some(width) = self.width {
            config.preview.width = width;
        }
        if let Some(height) = self.height {
            config.preview.height = height;
        }
        if let Some(fps) = self.fps {
            config.preview.fps = fps;
        }
        if self.no_mirror {
            config.capture.mirror = false;
        }
    }
}

/// Run the preview server until interrupted
pub async fn serve(args: ServeArgs, config_path: Option<PathBuf>) -> Result<()> {
    let mut config = PeepholeConfig::load(config_path).context("Failed to load configuration")?;
    args.apply(&mut config);

    config
        .validate_strict()
        .context("Invalid configuration")?;
    for warning in config.validate() {
        warn!("{}", warning);
    }

    let launcher = Arc::new(FfmpegLauncher::new(config.capture.clone()));
    let supervisor = Supervisor::spawn(launcher, config.capture_spec(), config.timings);
    let state = Arc::new(AppState::new(supervisor.clone(), &config));
    state
        .stills
        .ensure_dir()
        .await
        .context("Failed to create data directory")?;

    let listener = server::bind(config.listen_addr())
        .await
        .context("Failed to start HTTP server")?;

    println!("Peephole - Camera Preview\n");
    println!("  Listening:  http://localhost:{}", config.server.port);
    println!(
        "  Device:     {}:{} @ {}x{} {}fps",
        config.capture.input_format,
        config.preview.device,
        config.preview.width,
        config.preview.height,
        config.preview.fps
    );
    println!("  Captures:   {}", config.server.data_dir.display());
    println!();
    println!("Open http://localhost:{}/preview to watch.", config.server.port);
    println!("Press Ctrl+C to stop...\n");

    let shutdown = {
        let supervisor = supervisor.clone();
        async move {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received interrupt signal, shutting down");
            // Ends every open preview stream so the server can drain
            if let Err(e) = supervisor.shutdown().await {
                warn!("Supervisor shutdown: {}", e);
            }
        }
    };

    server::serve(listener, state, shutdown)
        .await
        .context("HTTP server failed")?;

    println!("Server stopped.");
    Ok(())
}
