//! MQTT Subscriber - Main Entry Point
//!
//! Connects to the configured broker, subscribes to every topic in the topic
//! file and logs (optionally stores) each received message until interrupted.

use clap::{Parser, Subcommand};
use mqtt_subscriber::config::{load_topics, ClientConfig};
use mqtt_subscriber::error::{AppError, AppResult};
use mqtt_subscriber::observability::{init_default_logging, init_logging, LogFormat};
use mqtt_subscriber::store::DocumentStore;
use mqtt_subscriber::transport::mqtt::{
    ChannelHandler, ClientError, ConnectionState, InboundMessage, MqttClient,
};
use std::env;
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};

/// Channel depth between the receive loop and the message consumer
const MESSAGE_BUFFER: usize = 1024;

/// Resilient MQTT topic subscriber
#[derive(Parser)]
#[command(name = "mqtt-subscriber")]
#[command(about = "Subscribe to MQTT topics and log or store every message")]
#[command(version)]
struct Cli {
    /// Broker configuration file (.json legacy layout or TOML)
    #[arg(short, long, value_name = "FILE", default_value = "cfg/mqtt.json")]
    config: PathBuf,

    /// Topic list, one topic per line
    #[arg(short, long, value_name = "FILE", default_value = "cfg/rx_subs_topics.txt")]
    topics: PathBuf,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and process messages until interrupted
    Run {
        /// Append every received message to this document store
        #[arg(long, value_name = "FILE", env = "MQTT_SUBSCRIBER_STORE")]
        store: Option<PathBuf>,
    },
    /// Validate the configuration
    Config {
        /// Print the configuration with secrets masked
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose > 0 {
        let level = if cli.verbose > 1 {
            Level::TRACE
        } else {
            Level::DEBUG
        };
        let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".into()));
        init_logging(level, format, true);
    } else {
        init_default_logging();
    }

    info!("Starting MQTT subscriber v{}", env!("CARGO_PKG_VERSION"));

    let result = match load_configuration(&cli.config) {
        Ok(config) => match cli.command {
            Commands::Run { store } => run_subscriber(config, &cli.topics, store).await,
            Commands::Config { show } => handle_config_command(&config, show),
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(e.exit_code());
    }

    info!("Application shutdown complete");
}

fn load_configuration(path: &Path) -> AppResult<ClientConfig> {
    info!("Loading configuration from: {}", path.display());
    Ok(ClientConfig::load_from_file(path)?)
}

async fn run_subscriber(
    config: ClientConfig,
    topics_path: &Path,
    store_path: Option<PathBuf>,
) -> AppResult<()> {
    let topics = load_topics(topics_path)?;
    info!("Loaded {} topic(s) from {}", topics.len(), topics_path.display());

    let store = store_path.map(|path| {
        info!("Storing messages in {}", path.display());
        DocumentStore::new(path)
    });

    let mut client = MqttClient::new(config, topics)?;
    let (handler, mut messages) = ChannelHandler::channel(MESSAGE_BUFFER);
    client.set_message_handler(handler);

    // The session is ended on every path out of here
    let outcome = match client.launch().await {
        Ok(()) => process_messages(&client, &mut messages, store.as_ref()).await,
        Err(e) => Err(e.into()),
    };
    client.end().await;

    let metrics = client.metrics();
    info!(
        received = metrics.messages_received,
        dispatched = metrics.messages_dispatched,
        reconnects = metrics.reconnects,
        "Session finished"
    );
    outcome
}

/// Consume messages until a signal arrives or the session fails
async fn process_messages(
    client: &MqttClient,
    messages: &mut mpsc::Receiver<InboundMessage>,
    store: Option<&DocumentStore>,
) -> AppResult<()> {
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| AppError::io("Failed to install SIGINT handler", e))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| AppError::io("Failed to install SIGTERM handler", e))?;
    let mut state = client.state_updates();

    info!("Subscriber is running and waiting for messages...");

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                return Ok(());
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                return Ok(());
            }
            changed = state.changed() => {
                let current = state.borrow_and_update().clone();
                if changed.is_err() || current.is_failed() {
                    error!("MQTT connection permanently lost, shutting down...");
                    return Err(ClientError::ConnectionFailed {
                        attempts: u32::try_from(client.metrics().connection_attempts)
                            .unwrap_or(u32::MAX),
                        reason: match current {
                            ConnectionState::Failed(reason) => reason,
                            other => format!("session ended in state {other:?}"),
                        },
                    }
                    .into());
                }
            }
            message = messages.recv() => match message {
                Some(message) => handle_message(message, store).await,
                None => {
                    warn!("Message channel closed");
                    return Ok(());
                }
            },
        }
    }
}

/// Log one message and store it; store failures are reported, never fatal
async fn handle_message(message: InboundMessage, store: Option<&DocumentStore>) {
    info!(
        topic = %message.topic,
        retain = message.retain,
        "Received: {}",
        message.payload_str()
    );

    if let Some(store) = store {
        if let Err(e) = store_message(store, &message).await {
            error!(topic = %message.topic, "Failed to store message: {}", e);
        }
    }
}

async fn store_message(store: &DocumentStore, message: &InboundMessage) -> AppResult<()> {
    let store = store.clone();
    let record = message.to_record();
    tokio::task::spawn_blocking(move || store.append(record))
        .await
        .map_err(|e| AppError::io("Store task failed", std::io::Error::other(e)))??;
    Ok(())
}

fn handle_config_command(config: &ClientConfig, show: bool) -> AppResult<()> {
    if show {
        let rendered = toml::to_string_pretty(&config.redacted()).map_err(|e| {
            AppError::Config(mqtt_subscriber::config::ConfigError::InvalidConfig(
                e.to_string(),
            ))
        })?;
        println!("Current configuration:");
        println!("{rendered}");
    }

    info!("Configuration validation complete");
    Ok(())
}
