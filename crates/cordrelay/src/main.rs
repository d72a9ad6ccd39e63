//! cordrelay
//!
//! Bridges a game server and a Discord guild. Session runtime events arrive
//! as NDJSON on stdin; commands for the runtime leave as NDJSON on stdout.
//! Discord messages and the ready signal arrive over the gateway session.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{error, info, warn};

use cordrelay::chat::{ChatClient, DiscordRestClient, gateway};
use cordrelay::host::{StdioRuntime, parse_line};
use cordrelay::queue::{OutboundQueue, QueueSettings};
use cordrelay::relay::{ChatLink, Relay, RelayEvent};
use cordrelay_core::config::load_config;
use cordrelay_core::geo::geo_from_config;
use cordrelay_core::tracing_init::init_tracing;

/// Upper bound on how long the loop sleeps with nothing scheduled.
const MAX_IDLE_WAIT: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "cordrelay")]
#[command(version, about = "cordrelay - Discord relay for game servers")]
struct Args {
    /// Path to the settings file.
    #[arg(long, env = "CORDRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Server capacity shown in the bot status.
    #[arg(long, default_value_t = 64)]
    max_players: u32,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("cordrelay=info", args.log_json);

    // Install ring as the default crypto provider for rustls.
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting cordrelay");

    let config = Arc::new(load_config(args.config.as_deref())?);
    let geo = geo_from_config(&config.geo);

    let (tx, mut events) = mpsc::channel::<RelayEvent>(256);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (chat, gateway_task) = if config.has_bot_token() {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let shard = gateway::connect(&config.bot_token);
        let client: Arc<dyn ChatClient> =
            Arc::new(DiscordRestClient::new(&config.bot_token, http).with_gateway(shard.sender()));
        let gateway_task = tokio::spawn(gateway::run(shard, tx.clone(), shutdown_rx));
        let queue = OutboundQueue::new(QueueSettings::from(&config.timing));
        queue.start(Arc::clone(&client));
        (Some(ChatLink { client, queue }), Some(gateway_task))
    } else {
        error!("Discord bot token is not configured, running without chat relay");
        (None, None)
    };
    let queue = chat.as_ref().map(|link| link.queue.clone());

    let runtime = StdioRuntime::new(std::io::stdout(), args.max_players);
    let mut relay = Relay::new(Arc::clone(&config), runtime, geo, chat);

    let mut stdin_task = tokio::spawn(read_events(tx));

    let started = Instant::now();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let wait = relay
            .next_deadline()
            .map_or(MAX_IDLE_WAIT, |at| at.saturating_sub(started.elapsed()))
            .min(MAX_IDLE_WAIT);

        tokio::select! {
            biased;
            event = events.recv() => {
                let Some(event) = event else {
                    info!("Event stream closed");
                    break;
                };
                relay.runtime_mut().observe(&event);
                relay.handle(event, started.elapsed());
            }
            _ = &mut stdin_task => {
                info!("Event stream closed");
                break;
            }
            () = tokio::time::sleep(wait) => {}
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
        }

        relay.tick(started.elapsed());
    }

    relay.shutdown();
    let _ = shutdown_tx.send(true);
    if let Some(queue) = queue {
        queue.stop(config.timing.drain_timeout()).await;
    }
    if let Some(task) = gateway_task
        && let Err(e) = task.await
    {
        warn!(error = %e, "Discord gateway task failed");
    }
    info!("cordrelay stopped");
    Ok(())
}

/// Forward parsed stdin events until EOF.
///
/// Stdin closing ends the relay even while the gateway is still connected.
async fn read_events(tx: mpsc::Sender<RelayEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_line(&line) {
                Ok(Some(event)) => {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Skipping malformed event line"),
            },
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Failed to read event stream");
                break;
            }
        }
    }
}
