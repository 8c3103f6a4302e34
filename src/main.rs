use std::path::PathBuf;

use moriod::config::{Presets, RawSettings};
use structopt::StructOpt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, StructOpt)]
#[structopt(name = "moriod", about = "Control plane for Morio deployments")]
struct Opt {
    /// Path to the presets file
    #[structopt(short, long, parse(from_os_str))]
    presets: Option<PathBuf>,

    /// Settings to set this node up with when it boots ephemeral
    #[structopt(long, parse(from_os_str))]
    setup: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command-line arguments
    let opt = Opt::from_args();

    // Load presets before logging so the preset level can apply
    let presets = Presets::load(opt.presets.as_deref())?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&presets.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting moriod...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Node: {}", presets.node_hostname);

    // Initialize the service
    let service = moriod::Service::new(presets).await.map_err(|e| {
        error!("Failed to start: {} ({})", e, e.error_code());
        e
    })?;

    if let Some(path) = opt.setup {
        let content = std::fs::read_to_string(&path)?;
        let settings = RawSettings::from_yaml_str(&content)?;
        match service.setup(settings).await {
            Ok(outcome) => info!(
                "Set up with config version {} (root {})",
                outcome.config.version, outcome.root_fingerprint
            ),
            Err(e) => warn!("Setup from {} not applied: {} ({})", path.display(), e, e.error_code()),
        }
    }

    // Create a shutdown channel
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    // Set up signal handling
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        let shutdown_tx_clone = shutdown_tx.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down...");
                    let _ = shutdown_tx_clone.send(()).await;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    let _ = shutdown_tx_clone.send(()).await;
                }
            }
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C, shutting down...");
                let _ = shutdown_tx.send(()).await;
            }
        });
    }

    // Wait for shutdown signal
    shutdown_rx.recv().await;

    // Shutdown the service
    info!("Shutting down moriod...");
    service.shutdown().await?;

    info!("moriod has been shut down.");
    Ok(())
}
