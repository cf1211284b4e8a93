//! MQTT session console
//!
//! Connects to the configured broker, prints every inbound message and
//! turns console lines into publish/subscribe commands.

use clap::{Parser, Subcommand};
use mqtt_session::config::{SessionConfig, DEFAULT_CONFIG_PATHS};
use mqtt_session::console::{self, ConsoleCommand, ConsoleOutcome};
use mqtt_session::observability::{init_default_logging, init_logging, LogFormat};
use mqtt_session::session::{MessageSink, SessionManager};
use mqtt_session::transport::MqttTransport;
use std::path::{Path, PathBuf};
use std::process;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn, Level};

/// Single-connection MQTT session console
#[derive(Parser)]
#[command(name = "mqtt-session")]
#[command(about = "Interactive MQTT session with publish/subscribe from the console")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and bridge the console to the session
    Run,
    /// Publish a single message and exit
    Publish {
        /// Topic to publish to (defaults to [topics].publish)
        #[arg(short, long)]
        topic: Option<String>,
        /// Message text
        message: String,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

type BoxError = Box<dyn std::error::Error>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Compact, true),
    }

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_console(config).await,
        Commands::Publish { topic, message } => publish_once(config, topic, message).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(config_path: Option<&Path>) -> Result<SessionConfig, BoxError> {
    let path = match config_path {
        Some(path) => path.to_path_buf(),
        None => SessionConfig::find_default().ok_or_else(|| {
            format!(
                "No configuration file found. Provide one with -c/--config or create one of: {}",
                DEFAULT_CONFIG_PATHS.join(", ")
            )
        })?,
    };

    info!("Loading configuration from: {}", path.display());
    Ok(SessionConfig::load_from_file(&path)?)
}

fn build_manager(config: &SessionConfig) -> Result<SessionManager<MqttTransport>, BoxError> {
    let connection = config.resolve()?;
    Ok(SessionManager::with_subscriptions(
        MqttTransport::new(),
        connection,
        config.topics.subscribe.iter().cloned(),
    )?)
}

async fn run_console(config: SessionConfig) -> Result<(), BoxError> {
    let manager = build_manager(&config)?;
    let default_topic = config.topics.publish.clone();

    let (sink, mut inbox) = MessageSink::channel();
    manager.set_active_sink(Some(sink));

    let printer = {
        let manager = manager.clone();
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                let filters = manager.active_subscriptions();
                println!("{}", console::format_inbound(&message, &filters));
            }
        })
    };

    let mut notices = manager.notices();
    let notice_printer = tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(notice) => {
                    if let Some(line) = console::format_notice(&notice) {
                        println!("{line}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Notice printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!(broker = %manager.connection_config().broker, "Connecting");
    manager.connect().await?;
    println!("Connected. Type /help for commands.");

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("Console input closed");
                    break;
                };
                let command = match ConsoleCommand::parse(&line) {
                    Ok(command) => command,
                    Err(e) => {
                        println!("{e}");
                        continue;
                    }
                };
                match console::execute(&manager, command, default_topic.as_deref()) {
                    ConsoleOutcome::Reply(reply) => println!("{reply}"),
                    ConsoleOutcome::Quit => break,
                }
            }
        }
    }

    info!("Application shutdown initiated");
    manager.set_active_sink(None);
    let result = manager.shutdown().await;
    printer.abort();
    notice_printer.abort();
    result?;
    info!("Application shutdown complete");
    Ok(())
}

async fn publish_once(
    config: SessionConfig,
    topic: Option<String>,
    message: String,
) -> Result<(), BoxError> {
    let topic = topic
        .or_else(|| config.topics.publish.clone())
        .ok_or("No topic given and [topics].publish is not configured")?;

    let manager = build_manager(&config)?;
    manager.connect().await?;

    let outcome = match manager.submit_publish(&topic, message) {
        Ok(handle) => handle.await,
        Err(e) => Err(e),
    };
    manager.shutdown().await?;
    outcome?;

    info!(%topic, "Message published");
    Ok(())
}

fn handle_config_command(config: &SessionConfig, show: bool) -> Result<(), BoxError> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    config.resolve()?;
    info!("Configuration validation complete");
    Ok(())
}
