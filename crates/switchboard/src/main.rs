//! Switchboard Bus
//!
//! Runs the message bus over the in-memory transport. With `--feed`, JSON
//! lines read from stdin are enqueued on the named queue.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use switchboard::transport::{MemoryTransport, RawMessage};
use switchboard::{BusManager, ConfigSource};
use switchboard_common::{BodyCodec, DecodedBody, Priority};

/// Switchboard Message Bus
#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(about = "Pluggable message bus with isolated handler hosts", long_about = None)]
struct Args {
    /// Path to the bus configuration file
    #[arg(short, long, default_value = "switchboard.toml")]
    config: PathBuf,

    /// Read JSON-line messages from stdin into this queue
    #[arg(long, value_name = "QUEUE_KEY")]
    feed: Option<String>,
}

/// One line of `--feed` input.
#[derive(Debug, Deserialize)]
struct FeedLine {
    id: Option<String>,
    #[serde(rename = "type")]
    type_name: Option<String>,
    #[serde(default)]
    body: serde_json::Value,
    label: Option<String>,
    priority: Option<Priority>,
    codec: Option<BodyCodec>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("switchboard=info,switchboard_common=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse command line arguments
    let args = Args::parse();

    info!("Starting Switchboard v{}", env!("CARGO_PKG_VERSION"));

    let transport = Arc::new(MemoryTransport::new());
    let bus = Arc::new(BusManager::new(
        ConfigSource::File(args.config.clone()),
        transport.clone(),
    ));

    if let Err(e) = bus.start().await {
        bail!("Bus did not start ({}): {}", args.config.display(), e);
    }
    if !bus.is_running() {
        bail!("Bus start was vetoed");
    }

    if let Some(queue) = args.feed {
        let codec = bus
            .config()
            .and_then(|config| config.queue(&queue).map(|q| q.codec))
            .with_context(|| format!("Queue '{}' is not configured", queue))?;
        tokio::spawn(feed_stdin(transport.clone(), queue, codec));
    }

    shutdown_signal().await;

    // Shutdown the bus gracefully
    info!("Stopping bus...");
    if let Err(e) = bus.stop().await {
        warn!("Bus did not stop cleanly: {}", e);
    }

    info!("Switchboard shutdown complete");
    Ok(())
}

async fn feed_stdin(transport: Arc<MemoryTransport>, queue: String, codec: BodyCodec) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut fed = 0usize;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read stdin: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match feed_message(&line, codec) {
            Ok(message) => match transport.send(&queue, message) {
                Ok(()) => fed += 1,
                Err(e) => {
                    warn!("Failed to enqueue message: {}", e);
                    break;
                }
            },
            Err(e) => warn!("Skipping feed line: {:#}", e),
        }
    }

    info!("Fed {} message(s) into {}", fed, queue);
}

fn feed_message(line: &str, queue_codec: BodyCodec) -> Result<RawMessage> {
    let feed: FeedLine = serde_json::from_str(line).context("invalid JSON")?;
    let codec = feed.codec.unwrap_or(queue_codec);

    let body = match (codec, feed.type_name) {
        (BodyCodec::Json, Some(type_name)) => DecodedBody::new(type_name, feed.body),
        (BodyCodec::Json, None) => bail!("JSON messages need a \"type\""),
        (BodyCodec::Text, _) => match feed.body {
            serde_json::Value::String(text) => DecodedBody::text(text),
            other => DecodedBody::text(other.to_string()),
        },
    };

    let id = feed.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut message = RawMessage::new(id)
        .with_codec(codec)
        .with_body(codec.encode(&body)?);
    if let Some(label) = feed.label {
        message = message.with_label(label);
    }
    if let Some(priority) = feed.priority {
        message = message.with_priority(priority);
    }
    Ok(message)
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
