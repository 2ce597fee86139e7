//! Quilt Daemon (`quiltd`)
//!
//! Headless daemon hosting the distributed data service. Runs with the
//! in-memory loopback transport until a platform transport driver is
//! bound; IPC stubs attach to the `DataService` surface in-process.

use clap::Parser;
use quilt_model::DataDir;
use quilt_service::{ServiceConfig, ServiceContext};
use quilt_sync::sim::ChannelNetwork;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "quiltd", version, about = "Quilt distributed data service daemon")]
struct Args {
    /// Data root; defaults to the platform data directory.
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,

    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    tracing::info!("quiltd v{} starting...", env!("CARGO_PKG_VERSION"));

    let data_dir = args
        .data_dir
        .map(DataDir::new)
        .unwrap_or_default();
    let network = ChannelNetwork::new();
    let transport = Arc::new(network.register("local"));

    let ctx = ServiceContext::initialize(ServiceConfig::new(data_dir, transport))
        .await
        .map_err(|status| anyhow::anyhow!("failed to start: {status}"))?;

    tracing::info!(
        device = %ctx.registry().local_device().fmt_short(),
        "daemon ready, press Ctrl+C to stop"
    );

    shutdown_signal().await;
    tracing::info!("shutdown signal received...");
    ctx.shutdown();
    tracing::info!("daemon stopped");
    Ok(())
}

fn init_tracing(verbosity: u8) {
    let mut filter = EnvFilter::from_default_env();

    // Only apply defaults if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        let level = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        filter = filter.add_directive(level.parse().expect("static level directive"));
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
    }
}
