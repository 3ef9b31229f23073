//! Device bridge - main entry point
//!
//! `run` connects the device, publishes each stdin line to the configured
//! topic and logs inbound messages until SIGINT, SIGTERM or end of input.

use clap::{Parser, Subcommand};
use iotcore_bridge::observability::init_default_logging;
use iotcore_bridge::{BridgeConfig, ConnectionState, EventSink, IotCoreClient};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: &[&str] = &["bridge.toml", "config/bridge.toml"];

/// How long stdin EOF waits for a connection before giving up on queued publishes
const EOF_CONNECT_GRACE: Duration = Duration::from_secs(15);

/// MQTT bridge for a cloud IoT device
#[derive(Parser)]
#[command(name = "iotcore-bridge")]
#[command(about = "Keep a device connected to the cloud IoT MQTT bridge")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "IOTCORE_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and bridge stdin lines to the publish topic
    Run,
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting iotcore-bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_bridge(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn load_configuration(config_path: Option<&Path>) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(BridgeConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = Path::new(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(BridgeConfig::load_from_file(path)?);
        }
    }

    Err(format!(
        "no configuration file found; pass -c/--config or create one of {DEFAULT_CONFIG_PATHS:?}"
    )
    .into())
}

async fn run_bridge(config: BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let sink = EventSink::new()
        .with_on_connect(|| info!("Connected to broker"))
        .with_on_disconnect(|| warn!("Disconnected from broker"))
        .with_on_message(|message| {
            println!("{}\t{}", message.topic, message.payload_text());
            Ok(())
        });

    let client = IotCoreClient::from_config(&config, sink)?;
    info!(client_id = %client.client_id(), "Connecting");
    client.connect()?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let topic = config.publish.topic.clone();
    let mut pending_publishes = false;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    match client.publish(&topic, line) {
                        Ok(()) => pending_publishes = true,
                        Err(e) => warn!(error = %e, "Publish dropped"),
                    }
                }
                None => {
                    info!("End of input, shutting down");
                    // Publishes queued before the first ConnAck need a connection to leave
                    if pending_publishes {
                        wait_for_connected(&client, EOF_CONNECT_GRACE).await;
                    }
                    break;
                }
            },
        }
    }

    client.disconnect();
    // Let the session flush its DISCONNECT
    tokio::time::sleep(iotcore_bridge::transport::mqtt::session::DISCONNECT_FLUSH_TIMEOUT).await;
    Ok(())
}

async fn wait_for_connected(client: &IotCoreClient, grace: Duration) {
    let mut state_rx = client.watch_state();
    let connected = tokio::time::timeout(grace, async {
        while *state_rx.borrow_and_update() != ConnectionState::Connected {
            if state_rx.changed().await.is_err() {
                break;
            }
        }
    })
    .await;

    if connected.is_err() {
        warn!("Not connected after {}s, queued publishes may be lost", grace.as_secs());
    }
}

fn handle_config_command(config: &BridgeConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
