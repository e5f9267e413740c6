//! vrm-bridge: relays avatar cues from the voice bridge to a VMC receiver.
//!
//! Accepts WebSocket clients on loopback and forwards blend shapes, bone
//! poses and emotion cues as VMC/OSC packets over UDP.

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use zundamon_voice::avatar::relay;
use zundamon_voice::config::Config;

#[derive(Parser, Debug)]
#[command(name = "vrm-bridge", about = "WebSocket to VMC/OSC relay for the avatar")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// WebSocket port (overrides config)
    #[arg(long)]
    ws_port: Option<u16>,

    /// VMC receiver port (overrides config)
    #[arg(long)]
    osc_port: Option<u16>,

    /// Start without idle emotion cycling
    #[arg(long)]
    no_idle: bool,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug,hyper=info,tungstenite=info")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = Config::load(args.config.as_deref()).relay;
    if let Some(port) = args.ws_port {
        config.ws_port = port;
    }
    if let Some(port) = args.osc_port {
        config.osc_port = port;
    }
    if args.no_idle {
        config.idle_on_start = false;
    }

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            shutdown.cancel();
        }
    });

    relay::serve(&config, cancel).await?;
    Ok(())
}
