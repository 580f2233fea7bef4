//! netplay - Binary client/server messaging runtime
//!
//! Command line front end running a small chat room on top of the runtime.

mod chat;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chat::{ChatClientMessage, ChatServerMessage, FLAG_CHAT_CLIENT, FLAG_CHAT_SERVER};
use netplay::config::{self, Config};
use netplay::network::{
    connect_hostname, register_connection_handlers, Connector, DefaultClientConnectorListener,
    DefaultServerStateListener, NetworkConfig, Registry, Server, ServerError,
};
use netplay::protocol::{
    self, ConnectionRejectedProtocolMismatchServerMessage, Message,
    FLAG_SERVER_CONNECTION_ACCEPTED, FLAG_SERVER_CONNECTION_CLOSE,
    FLAG_SERVER_CONNECTION_REJECTED_PROTOCOL_MISMATCH,
};

/// netplay - multiplayer messaging runtime
#[derive(Parser)]
#[command(name = "netplay")]
#[command(author = "Netplay Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Binary client/server messaging for multiplayer games", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a chat server
    Server {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind to
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Connect to a chat server and relay stdin lines
    Client {
        /// Server host to connect to
        #[arg(short, long, default_value = "127.0.0.1")]
        server: String,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    init_logging(cli.verbose || config.general.verbose, &config)?;

    match cli.command {
        Commands::Server { port, bind } => {
            let mut network = config.network.clone();
            if let Some(port) = port {
                network.port = port;
            }
            if let Some(bind) = bind {
                network.bind_address = bind;
            }
            run_server(&config, network).await?;
        }
        Commands::Client { server, port } => {
            let mut network = config.network.clone();
            if let Some(port) = port {
                network.port = port;
            }
            run_client(&config, &server, network).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, config: &Config) -> anyhow::Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let file_layer = match &config.general.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(file_layer)
        .with(filter)
        .init();
    Ok(())
}

/// Registry of a chat server; chat lines are forwarded to `lines`
fn server_registry(config: &Config, lines: mpsc::UnboundedSender<ChatServerMessage>) -> Registry {
    let mut registry: Registry = config.registry.build();
    registry.register_client_messages();
    register_connection_handlers(&mut registry, protocol::PROTOCOL_VERSION);
    registry.register_message_with_handler::<ChatClientMessage, _>(
        FLAG_CHAT_CLIENT,
        move |connector: &Arc<Connector>, message: &dyn Message| -> anyhow::Result<()> {
            let chat = message
                .downcast_ref::<ChatClientMessage>()
                .ok_or_else(|| anyhow::anyhow!("not a chat message"))?;
            lines.send(ChatServerMessage {
                sender: connector.peer().to_string(),
                text: chat.text.clone(),
            })?;
            Ok(())
        },
    );
    registry
}

/// Registry of a chat client; relayed lines are printed
fn client_registry(config: &Config) -> Registry {
    let mut registry: Registry = config.registry.build();
    registry.register_server_messages();
    registry.register_handler(
        FLAG_SERVER_CONNECTION_ACCEPTED,
        |connector: &Arc<Connector>, _: &dyn Message| -> anyhow::Result<()> {
            tracing::info!("Joined chat on {}", connector.peer());
            Ok(())
        },
    );
    registry.register_handler(
        FLAG_SERVER_CONNECTION_REJECTED_PROTOCOL_MISMATCH,
        |_: &Arc<Connector>, message: &dyn Message| -> anyhow::Result<()> {
            if let Some(rejected) =
                message.downcast_ref::<ConnectionRejectedProtocolMismatchServerMessage>()
            {
                tracing::error!(
                    "Server rejected us: it speaks protocol {}, we speak {}",
                    rejected.protocol_version,
                    protocol::PROTOCOL_VERSION
                );
            }
            Ok(())
        },
    );
    registry.register_handler(
        FLAG_SERVER_CONNECTION_CLOSE,
        |_: &Arc<Connector>, _: &dyn Message| -> anyhow::Result<()> {
            tracing::info!("Server is closing the connection");
            Ok(())
        },
    );
    registry.register_message_with_handler::<ChatServerMessage, _>(
        FLAG_CHAT_SERVER,
        |_: &Arc<Connector>, message: &dyn Message| -> anyhow::Result<()> {
            let chat = message
                .downcast_ref::<ChatServerMessage>()
                .ok_or_else(|| anyhow::anyhow!("not a chat message"))?;
            println!("[{}] {}", chat.sender, chat.text);
            Ok(())
        },
    );
    registry
}

/// Run the chat server until Ctrl+C
async fn run_server(config: &Config, network: NetworkConfig) -> anyhow::Result<()> {
    let address = network.listen_address();
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|e| ServerError::BindFailed(format!("{}: {}", address, e)))?;

    tracing::info!("Starting netplay server '{}' on {}", config.general.name, address);

    let (line_tx, mut line_rx) = mpsc::unbounded_channel();
    let server = Server::with_listeners(
        listener,
        Arc::new(server_registry(config, line_tx)),
        Arc::new(DefaultClientConnectorListener),
        Arc::new(DefaultServerStateListener),
        network.connector_config(),
    );
    let mut accept_loop = server.start()?;

    println!("\n========================================");
    println!("  netplay Server Running");
    println!("========================================");
    println!("  Name: {}", config.general.name);
    println!("  Address: {}", server.local_description());
    println!("  Protocol: {}", protocol::PROTOCOL_VERSION);
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    let mut accept_loop_done = false;
    loop {
        tokio::select! {
            Some(line) = line_rx.recv() => {
                println!("[{}] {}", line.sender, line.text);
                let delivered = server.broadcast(&line).await;
                tracing::debug!("Relayed line to {} of {} clients", delivered, server.connector_count());
            }
            result = &mut accept_loop => {
                accept_loop_done = true;
                if let Err(e) = result {
                    tracing::error!("Accept loop failed: {}", e);
                }
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    server.close().await;
    if !accept_loop_done {
        accept_loop.await?;
    }
    tracing::info!("Server stopped");

    Ok(())
}

/// Run the chat client until stdin ends, the server leaves or Ctrl+C
async fn run_client(config: &Config, host: &str, network: NetworkConfig) -> anyhow::Result<()> {
    println!("Connecting to {}:{}...", host, network.port);
    let (connector, mut read_loop) =
        connect_hostname(host, Arc::new(client_registry(config)), None, &network)
            .await?;

    println!("Connected as {}. Type a line to send it.\n", config.general.name);

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut read_loop_done = false;
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(text) if text.is_empty() => {}
                Some(text) => {
                    if let Err(e) = connector.send(&ChatClientMessage { text }).await {
                        tracing::warn!("Could not send: {}", e);
                        break;
                    }
                }
                None => break,
            },
            result = &mut read_loop => {
                read_loop_done = true;
                if let Err(e) = result {
                    tracing::error!("Read loop failed: {}", e);
                }
                println!("Disconnected from server");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    connector.close().await;
    if !read_loop_done {
        read_loop.await?;
    }
    tracing::info!("Client disconnected");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["netplay", "server", "--port", "4000"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Server {
                port: Some(4000),
                bind: None
            }
        ));

        let cli = Cli::try_parse_from(["netplay", "-v", "client", "-s", "example.org"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Client { ref server, port: None } if server == "example.org"));

        assert!(Cli::try_parse_from(["netplay", "discover"]).is_err());
    }

    #[test]
    fn test_registries_cover_chat_flags() {
        let config = Config::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let server = server_registry(&config, tx);
        assert!(server.has_handler(FLAG_CHAT_CLIENT));
        assert!(server.has_handler(protocol::FLAG_CLIENT_CONNECTION_ESTABLISH));
        assert!(server.is_registered(protocol::FLAG_CLIENT_CONNECTION_CLOSE));

        let client = client_registry(&config);
        assert!(client.has_handler(FLAG_CHAT_SERVER));
        assert!(client.is_registered(protocol::FLAG_SERVER_CONNECTION_PONG));
    }
}
