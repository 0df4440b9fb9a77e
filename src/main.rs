//! brokerlink - run configured MQTT nodes against shared broker connections
//!
//! Flow messages arrive on stdin as newline-delimited JSON; messages received
//! by input nodes are written to stdout, one JSON object per line.

use brokerlink::broker::BrokerRegistry;
use brokerlink::config::{BridgeConfig, NodeKind};
use brokerlink::message::{FlowMessage, Message};
use brokerlink::node::{InputNode, NodeParams, OutputNode, ValueSource};
use brokerlink::observability::{init_default_logging, StatusSink, TracingStatus};
use brokerlink::{MqttConnector, TokenFetcher};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared MQTT broker connections for message-driven nodes
#[derive(Parser)]
#[command(name = "brokerlink")]
#[command(about = "Run MQTT input/output nodes over shared broker connections")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "BROKERLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the configured nodes and feed them from stdin
    Run,
    /// Validate the configuration file
    Config {
        /// Print the parsed configuration
        #[arg(long)]
        show: bool,
    },
}

enum Node {
    Input(Arc<InputNode>),
    Output(Arc<OutputNode>),
}

impl Node {
    async fn on_input(&self, message: &FlowMessage) {
        let (id, result) = match self {
            Node::Input(node) => (node.id(), node.on_input(message).await),
            Node::Output(node) => (node.id(), node.on_input(message).await),
        };
        if let Err(e) = result {
            debug!(node = %id, error = %e.redacted(), "Message not handled");
        }
    }

    async fn close(&self) {
        match self {
            Node::Input(node) => node.close().await,
            Node::Output(node) => node.close().await,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose > 0 && std::env::var("LOG_LEVEL").is_err() {
        let level = if cli.verbose > 1 { "TRACE" } else { "DEBUG" };
        std::env::set_var("LOG_LEVEL", level);
    }
    init_default_logging();

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_bridge(config).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(BridgeConfig::load_from_file(path)?);
    }

    for candidate in ["brokerlink.toml", "config/brokerlink.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(BridgeConfig::load_from_file(&path)?);
        }
    }

    Err("no configuration file found; pass -c/--config or create brokerlink.toml".into())
}

async fn run_bridge(config: BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let tokens = TokenFetcher::new(config.settings.auth_timeout())?;
    let registry = Arc::new(BrokerRegistry::new(
        config.settings.clone(),
        Arc::new(MqttConnector),
        Arc::new(tokens),
    ));
    let status: Arc<dyn StatusSink> = Arc::new(TracingStatus);

    let mut nodes = Vec::with_capacity(config.nodes.len());
    for node_config in config.nodes {
        let params = NodeParams::parse(node_config);
        let node = match params.kind() {
            NodeKind::Input => {
                let (tx, rx) = mpsc::unbounded_channel();
                let id = params.id().to_string();
                let node = InputNode::new(params, registry.clone(), status.clone(), tx);
                tokio::spawn(print_deliveries(id, rx));
                Node::Input(node)
            }
            NodeKind::Output => Node::Output(OutputNode::new(params, registry.clone(), status.clone())),
        };

        let started = match &node {
            Node::Input(node) => node.start().await,
            Node::Output(node) => node.start().await,
        };
        if let Err(e) = started {
            warn!(error = %e.redacted(), "Node did not start");
        }
        nodes.push(node);
    }
    info!(nodes = nodes.len(), "Nodes started, reading flow messages from stdin");

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

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
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("Input closed, shutting down");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(value) => {
                        let message = FlowMessage::from_json(value);
                        for node in &nodes {
                            node.on_input(&message).await;
                        }
                    }
                    Err(e) => warn!(error = %e, "Skipping line that is not JSON"),
                }
            }
        }
    }

    for node in &nodes {
        node.close().await;
    }
    info!(brokers = registry.len(), "Shutdown complete");
    Ok(())
}

async fn print_deliveries(node: String, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        println!("{}", json!({"node": node, "message": message}));
    }
}

fn handle_config_command(
    mut config: BridgeConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        for node in &mut config.nodes {
            if matches!(node.password, ValueSource::Literal(_)) {
                node.password = ValueSource::literal("***");
            }
        }
        println!("{}", serde_json::to_string_pretty(&config)?);
    }

    info!(nodes = config.nodes.len(), "Configuration is valid");
    Ok(())
}
