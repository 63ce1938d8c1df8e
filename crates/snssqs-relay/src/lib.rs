//! # SNS/SQS Relay
//!
//! Command-line front end for the SNS/SQS transport.
//!
//! This module provides CLI commands for:
//! - Consuming from the transport queue, optionally acknowledging
//! - Publishing a single message to the transport topic
//! - Validating and printing the resolved settings

use anyhow::Context;
use clap::{Parser, Subcommand};
use snssqs_transport::{
    Attributes, ConfigurationError, ReceivedMessage, Transport, TransportError, TransportSettings,
};
use std::future::Future;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

// ============================================================================
// CLI Structure
// ============================================================================

/// SNS/SQS relay - consume and publish through the pipe transport
#[derive(Parser, Debug)]
#[command(name = "snssqs-relay")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Consume and publish through the SNS/SQS pipe transport")]
pub struct Cli {
    /// Settings file path (YAML, TOML or JSON)
    #[arg(short, long, env = "SNSSQS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Consume messages from the transport queue until interrupted
    Consume {
        /// Pipes to subscribe; `keepalives` selects the keepalive channel
        #[arg(short, long = "pipe", default_values = ["default", "keepalives"])]
        pipes: Vec<String>,

        /// Subscription classification
        #[arg(long, default_value = "direct")]
        classification: String,

        /// Acknowledge every consumed message
        #[arg(long)]
        ack: bool,

        /// Stop after this many messages
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Publish one message to the transport topic
    Publish {
        /// Message classification, sent as the `type` attribute
        #[arg(short = 't', long = "type")]
        classification: String,

        /// Message pipe
        #[arg(short, long)]
        pipe: String,

        /// Extra attributes as key=value
        #[arg(short, long = "attr", value_parser = parse_attribute)]
        attributes: Vec<(String, String)>,

        /// Message body
        body: String,
    },

    /// Validate the settings and print them with secrets redacted
    CheckConfig {
        /// Output format
        #[arg(short, long, default_value = "yaml")]
        format: OutputFormat,
    },
}

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// YAML output
    Yaml,
    /// JSON output
    Json,
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("Output error: {message}")]
    Output { message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Transport(TransportError::Configuration(_)) => 1,
            Self::Transport(_) => 2,
            Self::InvalidArgument { .. } => 3,
            Self::Output { .. } => 4,
            Self::Other(_) => 5,
        }
    }
}

/// Parse a `key=value` attribute argument
pub fn parse_attribute(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, val)) if !key.is_empty() => Ok((key.to_string(), val.to_string())),
        _ => Err(format!("expected key=value, got '{}'", value)),
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli.log_level, cli.json_logs)?;

    let settings = TransportSettings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::CheckConfig { format } => {
            println!("{}", render_settings(&settings, format)?);
            Ok(())
        }
        Commands::Publish {
            classification,
            pipe,
            attributes,
            body,
        } => {
            let transport = Transport::connect(&settings)?;
            let message_id =
                execute_publish(&transport, &classification, &pipe, attributes, body).await?;
            println!("{}", message_id);
            Ok(())
        }
        Commands::Consume {
            pipes,
            classification,
            ack,
            limit,
        } => {
            let transport = Transport::connect(&settings)?;
            let options = ConsumeOptions {
                pipes,
                classification,
                acknowledge: ack,
                limit,
            };
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Failed to listen for Ctrl-C, running until killed");
                    std::future::pending::<()>().await;
                }
            };
            let summary = execute_consume(&transport, options, shutdown).await?;
            info!(
                consumed = summary.consumed,
                acknowledged = summary.acknowledged,
                "Consumer stopped"
            );
            Ok(())
        }
    }
}

/// Install the tracing subscriber. `RUST_LOG` takes precedence over `level`.
pub fn initialize_logging(level: &str, json: bool) -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "snssqs_transport={level},snssqs_relay={level}",
            level = level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    result.context("Failed to initialize logging")?;
    Ok(())
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Render settings for `check-config`, secrets redacted
pub fn render_settings(
    settings: &TransportSettings,
    format: OutputFormat,
) -> Result<String, CliError> {
    let redacted = settings.redacted();
    match format {
        OutputFormat::Yaml => serde_yaml::to_string(&redacted).map_err(|e| CliError::Output {
            message: e.to_string(),
        }),
        OutputFormat::Json => {
            serde_json::to_string_pretty(&redacted).map_err(|e| CliError::Output {
                message: e.to_string(),
            })
        }
    }
}

/// Publish one message and return the broker's message id
pub async fn execute_publish(
    transport: &Transport,
    classification: &str,
    pipe: &str,
    attributes: Vec<(String, String)>,
    body: String,
) -> Result<String, CliError> {
    let options: Attributes = attributes.into_iter().collect();

    info!(
        classification = %classification,
        pipe = %pipe,
        attributes = options.len(),
        "Publishing message"
    );

    let response = transport
        .publish(classification, pipe, body, options, None)
        .await
        .map_err(TransportError::from)??;

    Ok(response.message_id.to_string())
}

/// What `consume` subscribes to and does with each message
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub pipes: Vec<String>,
    pub classification: String,
    pub acknowledge: bool,
    pub limit: Option<usize>,
}

/// Totals reported when `consume` stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeSummary {
    pub consumed: usize,
    pub acknowledged: usize,
}

/// Log every dispatched message until `shutdown` completes or the limit is hit
pub async fn execute_consume<S>(
    transport: &Transport,
    options: ConsumeOptions,
    shutdown: S,
) -> Result<ConsumeSummary, CliError>
where
    S: Future<Output = ()>,
{
    if options.pipes.is_empty() {
        return Err(CliError::InvalidArgument {
            arg: "pipe".to_string(),
            message: "at least one pipe is required".to_string(),
        });
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<ReceivedMessage>();
    for pipe in &options.pipes {
        let tx = tx.clone();
        let channel = transport.subscribe(
            &options.classification,
            pipe,
            None,
            &Attributes::new(),
            move |message: ReceivedMessage| {
                let _ = tx.send(message);
                std::future::ready(())
            },
        )?;
        match channel {
            Some(channel) => info!(pipe = %pipe, channel = %channel, "Subscribed"),
            None => warn!(pipe = %pipe, "Subscription ignored"),
        }
    }
    drop(tx);

    let mut summary = ConsumeSummary::default();
    tokio::pin!(shutdown);

    loop {
        if options.limit.is_some_and(|limit| summary.consumed >= limit) {
            break;
        }

        let message = tokio::select! {
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
        };

        summary.consumed += 1;
        info!(
            message_id = %message.message_id,
            pipe = message.pipe().unwrap_or_default(),
            message_type = message.message_type().unwrap_or_default(),
            body_len = message.body.len(),
            "Message received"
        );

        if options.acknowledge {
            match transport
                .acknowledge(message, None)
                .await
                .map_err(TransportError::from)?
            {
                Ok(()) => summary.acknowledged += 1,
                Err(e) => warn!(error = %e, "Failed to acknowledge message"),
            }
        }
    }

    Ok(summary)
}
