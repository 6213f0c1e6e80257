//! Shroud Peer
//!
//! A standalone Shroud endpoint. `listen` accepts negotiated streams and
//! logs every reassembled message; `send` negotiates a stream with a
//! remote peer and sends messages over it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use shroud_core::{media_hash, MediaStreamType};
use shroud_engine::{EngineConfig, Endpoint, ForwardingFactory};
use shroud_transport::Pacing;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shroud-peer")]
#[command(about = "Shroud peer - send and receive media streams over UDP")]
#[command(version)]
struct Cli {
    /// Config file path (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept streams and print every message
    Listen {
        /// Local address
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// Negotiate a stream with a remote peer and send messages on it
    Send {
        /// Local address
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Remote peer
        #[arg(short, long)]
        to: SocketAddr,

        /// Stream type
        #[arg(short = 'y', long = "type", default_value = "text")]
        media_type: MediaStreamType,

        /// Media hash (random when omitted)
        #[arg(long)]
        hash: Option<i32>,

        /// Cap the send rate in chunks per second
        #[arg(short, long)]
        rate: Option<u32>,

        /// Request an ack for every chunk
        #[arg(short, long)]
        ack: bool,

        /// Messages to send
        #[arg(required = true)]
        messages: Vec<String>,
    },
}

/// Config file layout: engine sections plus a default bind address
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PeerConfig {
    bind: Option<SocketAddr>,
    #[serde(flatten)]
    engine: EngineConfig,
}

impl PeerConfig {
    fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    fn bind(&self, flag: Option<SocketAddr>, fallback: &str) -> Result<SocketAddr> {
        match flag.or(self.bind) {
            Some(addr) => Ok(addr),
            None => Ok(fallback.parse()?),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &cli.config {
        Some(path) => PeerConfig::load(Path::new(path))?,
        None => PeerConfig::default(),
    };

    match cli.command {
        Commands::Listen { bind } => {
            let bind = config.bind(bind, "0.0.0.0:7400")?;
            listen(bind, config.engine).await
        }
        Commands::Send {
            bind,
            to,
            media_type,
            hash,
            rate,
            ack,
            messages,
        } => {
            let bind = config.bind(bind, "0.0.0.0:0")?;
            let mut engine = config.engine;
            if let Some(rate) = rate {
                engine.streamer.delivery.pacing = Pacing::ChunksPerSecond { rate };
            }
            engine.streamer.delivery.ack_required |= ack;

            let hash = hash.unwrap_or_else(media_hash::random);
            send(bind, to, media_type, hash, engine, messages).await
        }
    }
}

async fn listen(bind: SocketAddr, config: EngineConfig) -> Result<()> {
    let endpoint = Endpoint::bind(&bind.to_string(), config).await?;
    let media_types: Vec<MediaStreamType> = MediaStreamType::ALL
        .into_iter()
        .filter(|t| t.is_media())
        .collect();
    let (factory, mut results) = ForwardingFactory::new(media_types);
    endpoint.set_processor_factory(Arc::new(factory));

    tracing::info!("Listening on {}", endpoint.local_addr());

    loop {
        tokio::select! {
            result = results.recv() => {
                let Some(result) = result else { break };
                let from = result
                    .remote_address
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "?".into());
                match (result.media_type, std::str::from_utf8(&result.payload)) {
                    (MediaStreamType::Text, Ok(text)) => {
                        println!(
                            "[{} {} from {}] {}",
                            result.media_type, result.media_hash, from, text
                        );
                    }
                    _ => {
                        println!(
                            "[{} {} from {}] {} bytes",
                            result.media_type,
                            result.media_hash,
                            from,
                            result.payload.len()
                        );
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    endpoint.shutdown().await;
    Ok(())
}

async fn send(
    bind: SocketAddr,
    to: SocketAddr,
    media_type: MediaStreamType,
    hash: i32,
    config: EngineConfig,
    messages: Vec<String>,
) -> Result<()> {
    let endpoint = Endpoint::bind(&bind.to_string(), config).await?;
    tracing::info!(
        "Negotiating {} stream {} with {} from {}",
        media_type,
        hash,
        to,
        endpoint.local_addr()
    );

    let streamer = endpoint
        .open_stream(media_type, hash, to)
        .await
        .with_context(|| format!("{} refused {} stream {}", to, media_type, hash))?;
    streamer.start()?;

    for message in messages {
        streamer.send(message).await?;
    }
    streamer.drain().await?;

    let delivery = streamer.delivery()?;
    let stats = delivery.stats();
    tracing::info!(
        "Sent {} chunks ({} retransmits, {} unacked)",
        stats.chunks_sent(),
        stats.retransmits(),
        stats.unacked()
    );

    endpoint.shutdown().await;
    Ok(())
}
