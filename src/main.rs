//! moq-channel - Media over QUIC session engine
//!
//! Bridges telephony calls to MoQ peers: WebSocket signaling for call
//! setup, framed UDP for media.

mod bridge;
mod config;
mod media;
mod signaling;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "moq-channel")]
#[command(about = "Media over QUIC channel for telephony call bridges", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Register with signaling and answer incoming calls
    Serve {
        /// Echo received media back to the caller
        #[arg(long)]
        echo: bool,
    },

    /// Place a call and stream silence
    Call {
        /// Destination user id, or user@host[:port] for a direct media peer
        dest: String,

        /// Duration in seconds to keep the call active
        #[arg(short, long, default_value = "15")]
        duration: u64,
    },

    /// Run the WebSocket signaling router
    SignalingServer {
        /// Port to listen on
        #[arg(short, long, default_value_t = config::DEFAULT_SIGNALING_PORT)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Serve { echo } => {
            let ctx = config::Context::load(cli.config)?;
            bridge::run_serve(ctx, echo).await?;
        }
        Commands::Call { dest, duration } => {
            let ctx = config::Context::load(cli.config)?;
            tracing::info!("Calling {}...", dest);
            bridge::run_call(ctx, &dest, duration).await?;
        }
        Commands::SignalingServer { port } => {
            bridge::run_signaling_server(port).await?;
        }
    }

    Ok(())
}
