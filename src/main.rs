#![forbid(unsafe_code)]

//! `acp-bridge` binary: run one prompt turn against a configured agent.
//!
//! Domain events are written to stdout as JSON lines while the turn runs;
//! the final message text follows once the turn completes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use acp_bridge::event_bus::{EventBus, EventSink};
use acp_bridge::models::conversation::ConversationKey;
use acp_bridge::session::{AcpChat, ChatMessage};
use acp_bridge::{AppError, BridgeConfig, Result};

/// How long to wait for queued events to be printed after the turn.
const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "acp-bridge", about = "Stdio bridge to ACP agents", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Conversation key; defaults to `unknown`.
    #[arg(long)]
    conversation: Option<String>,

    /// Prompt text sent as a single user message.
    #[arg(long)]
    prompt: String,

    /// Optional system message sent before the prompt.
    #[arg(long)]
    system: Option<String>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = Arc::new(BridgeConfig::load_from_path(&args.config)?);
    info!(command = %config.command, "configuration loaded");

    // ── Event output ────────────────────────────────────
    let bus = EventBus::new();
    let mut events = bus.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(err) => warn!(%err, "failed to serialize event"),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event output lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let sink: Arc<dyn EventSink> = Arc::new(bus);
    let chat = AcpChat::new(Arc::clone(&config), sink);
    let conversation = ConversationKey::from_optional(args.conversation);

    let mut messages = Vec::new();
    if let Some(system) = args.system {
        messages.push(ChatMessage::system(system));
    }
    messages.push(ChatMessage::user(args.prompt));

    // ── Run the turn ────────────────────────────────────
    let outcome = tokio::select! {
        outcome = chat.prompt(&conversation, &messages) => outcome,
        () = shutdown_signal() => {
            info!("shutdown signal received");
            Err(AppError::Transport("interrupted".into()))
        }
    };

    chat.end_conversation(&conversation);
    drop(chat);
    let printer_abort = printer.abort_handle();
    match tokio::time::timeout(EVENT_DRAIN_TIMEOUT, printer).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(%err, "event printer task failed"),
        Err(_) => printer_abort.abort(),
    }

    match outcome {
        Ok(response) => {
            println!("{}", response.text());
            info!(stop_reason = %response.stop_reason, "acp-bridge finished");
            Ok(())
        }
        Err(err) => {
            error!(%err, "prompt failed");
            Err(err)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
