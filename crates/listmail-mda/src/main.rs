//! Listmail - mail delivery agent entry point
//!
//! Run from the MTA once per message, e.g. as a Postfix pipe transport:
//! the message arrives on stdin, the addressing context in the environment.

use anyhow::Context;
use clap::Parser;
use listmail_common::Config;
use listmail_core::{DeliveryAgent, Invocation, MemoryTransport, SmtpRelay, Transport, EX_CONFIG};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "listmail-mda")]
#[command(about = "Deliver one message from stdin to a mailing list", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to $LISTMAIL_CONFIG, then /etc/listmail/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Process the message but log outbound mail instead of sending it
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match cli.config.as_deref() {
        Some(path) => Config::from_file(path),
        None => Config::load(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            // Logging is not configured yet.
            eprintln!("listmail-mda: {}", e);
            return exit_code(EX_CONFIG);
        }
    };

    init_logging(&config);

    match run(cli, config).await {
        Ok(code) => exit_code(code),
        Err(e) => {
            error!(error = ?e, "Delivery agent failed before handling the message");
            exit_code(EX_CONFIG)
        }
    }
}

async fn run(cli: Cli, config: Config) -> anyhow::Result<i32> {
    let invocation = Invocation::from_env()?;

    let mut raw = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut raw)
        .await
        .context("Failed to read message from stdin")?;
    info!(
        recipient = %invocation.recipient,
        return_path = ?invocation.return_path,
        bytes = raw.len(),
        dry_run = cli.dry_run,
        "Received message"
    );

    let recorder = Arc::new(MemoryTransport::new());
    let transport: Arc<dyn Transport> = if cli.dry_run {
        recorder.clone()
    } else {
        Arc::new(SmtpRelay::from_config(&config))
    };

    let agent = DeliveryAgent::from_config(config, transport);
    let outcome = agent.handle(&invocation, raw).await;

    for sent in recorder.sent() {
        info!(
            envelope_from = %sent.envelope_from,
            recipients = ?sent.recipients,
            bytes = sent.message.len(),
            "Dry run: would send"
        );
    }

    info!(outcome = ?outcome, exit_code = outcome.exit_code(), "Done");
    Ok(outcome.exit_code())
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
