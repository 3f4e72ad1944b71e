//! confab: drive the realtime core from the command line
//!
//! The demo commands run the real message and call sessions over the
//! loopback transports, which is handy for checking a configuration file
//! and watching the event flow without a broker or PBX at hand.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use confab_realtime_core::logging::{parse_log_level, setup_logging, LoggingConfig};
use confab_realtime_core::prelude::*;

#[derive(Parser, Debug)]
#[command(author, version, about = "Confab realtime session tool", long_about = None)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "CONFAB_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "CONFAB_LOG_LEVEL", global = true)]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open a channel, send messages through a loopback broker and print what arrives
    DemoChat {
        /// Channel key
        #[arg(long, default_value = "group-1")]
        key: String,

        /// Sender name
        #[arg(long, default_value = "alice")]
        sender: String,

        /// Receiver name; defaults to the broadcast receiver
        #[arg(long)]
        to: Option<String>,

        /// Message bodies to send
        #[arg(required = true)]
        messages: Vec<String>,
    },

    /// Register, dial a number on a scripted peer and hang up
    DemoCall {
        /// Number to dial
        number: String,

        /// Seconds to stay connected
        #[arg(long, default_value = "2")]
        hold_secs: u64,
    },

    /// Print the effective configuration as JSON
    PrintConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::new(parse_log_level(&cli.log_level)?);
    if cli.json {
        logging = logging.with_json();
    }
    setup_logging(logging)?;

    let config = RealtimeConfig::load(cli.config.as_deref()).context("loading configuration")?;
    debug!(?config, "Configuration loaded");

    match cli.command {
        Command::DemoChat {
            key,
            sender,
            to,
            messages,
        } => demo_chat(config, key, sender, to, messages).await,
        Command::DemoCall { number, hold_secs } => demo_call(config, &number, hold_secs).await,
        Command::PrintConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn demo_chat(
    config: RealtimeConfig,
    key: String,
    sender: String,
    to: Option<String>,
    messages: Vec<String>,
) -> Result<()> {
    let channel_config = config.channel.clone();
    let broker = MemoryBroker::new();
    let orchestrator = SessionOrchestrator::builder(config)
        .with_transport_factory(Arc::new(broker.clone()))
        .build()?;

    orchestrator.on_message(|key, message| {
        println!(
            "[{}] {} -> {}: {}",
            key, message.sender_id, message.receiver_key, message.body
        );
    });
    orchestrator.on_connection_status_changed(|status| {
        info!(source = ?status.source, status = ?status.status, detail = ?status.detail, "Connection status");
    });

    let channel = orchestrator.open_channel(key.as_str())?;
    channel
        .state_watch()
        .wait_for(|s| *s == ConnectionState::Connected)
        .await
        .context("channel closed before connecting")?;

    let receiver = to.unwrap_or_else(|| channel_config.broadcast_receiver.clone());
    orchestrator
        .send_to(channel.key(), OutboundMessage::join(sender.as_str(), receiver.as_str()))
        .await?;
    for body in messages {
        orchestrator
            .send_to(
                channel.key(),
                OutboundMessage::new(sender.as_str(), receiver.as_str(), body),
            )
            .await?;
    }
    // Publishing completes after the send reply; a snapshot round-trip waits for it.
    channel.snapshot().await?;

    // The loopback broker has no server behind it; play its part and echo
    // every chat frame back on the topic a server would use.
    for frame in broker.published() {
        let topic = if frame.destination == channel_config.public_destination
            || frame.destination == channel_config.join_destination
        {
            channel_config.broadcast_topic.clone()
        } else {
            channel_config.personal_topic(&key)
        };
        broker.deliver(&topic, &frame.body);
    }

    let conversation = orchestrator.conversation(channel.key()).await?;
    println!("{}", serde_json::to_string_pretty(&conversation)?);

    orchestrator.shutdown().await;
    Ok(())
}

async fn demo_call(config: RealtimeConfig, number: &str, hold_secs: u64) -> Result<()> {
    let signaling = MemorySignaling::new();
    let orchestrator = SessionOrchestrator::builder(config)
        .with_transport_factory(Arc::new(MemoryBroker::new()))
        .with_signaling(Arc::new(signaling.clone()))
        .with_call_cleanup(|record| match serde_json::to_string_pretty(record) {
            Ok(json) => println!("{}", json),
            Err(e) => tracing::warn!(error = %e, "Could not serialize call record"),
        })
        .build()?;

    orchestrator.on_call_state_changed(|info| {
        info!(call_id = ?info.call_id, state = %info.new_state, reason = ?info.reason, "Call state");
    });

    let controller = orchestrator
        .call_controller()
        .context("signaling is not configured")?;
    let mut snapshot = controller.snapshot_watch();

    orchestrator.start_signaling().await?;
    snapshot
        .wait_for(|s| s.registration == CallState::Ready)
        .await
        .context("controller stopped before registering")?;

    let call_id = orchestrator.make_call(number).await?;
    info!(%call_id, "Dialing {}", number);

    // Scripted peer picks up straight away.
    if let Some(peer) = signaling.sessions().last() {
        peer.accept();
    }
    snapshot
        .wait_for(|s| s.state == CallState::Connected)
        .await
        .context("controller stopped before the call connected")?;

    tokio::time::sleep(Duration::from_secs(hold_secs)).await;
    if let Some(duration) = orchestrator.call_duration() {
        info!(secs = duration.as_secs(), "Hanging up");
    }
    orchestrator.hangup().await?;
    orchestrator.shutdown().await;
    Ok(())
}
