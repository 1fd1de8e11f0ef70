use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use vendwatch::commands::{ChatCommand, parse_command};
use vendwatch::config::{AppConfig, CONFIG_PATH};
use vendwatch::intel::MarketIntel;
use vendwatch::items::{ItemDatabase, ItemResolver};
use vendwatch::manager::{self, ManagerConfig, ManagerHandle, WsConnector};
use vendwatch::notify;
use vendwatch::pairing::{FilePairing, PairingClient};
use vendwatch::reporter;
use vendwatch::session::{SessionError, TeamMessage};
use vendwatch::types::{CycleTrigger, RunSummary};

#[derive(Parser)]
#[command(name = "vendwatch", about = "Vending-market watcher for a paired companion server")]
struct Args {
    /// Config file path
    #[arg(long, default_value = CONFIG_PATH)]
    config: String,

    /// Override the ally shop-name marker from config
    #[arg(long)]
    ally_prefix: Option<String>,

    /// Override the refresh interval in seconds
    #[arg(long)]
    refresh_interval: Option<u64>,

    /// Run one refresh cycle, print the report, and exit without
    /// announcing anything to chat
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_path = Path::new(&args.config);
    let config = AppConfig::load_or_default(config_path)?;
    info!("Loaded config from {}", config_path.display());

    let ally_prefix = args
        .ally_prefix
        .unwrap_or_else(|| config.settings.ally_prefix.clone());
    let refresh_secs = args
        .refresh_interval
        .unwrap_or(config.settings.refresh_interval_secs);
    if refresh_secs == 0 {
        anyhow::bail!("--refresh-interval must be positive");
    }
    if ally_prefix.is_empty() {
        warn!("ally prefix is empty — every shop will be treated as enemy");
    }

    let notify_delay = config.settings.notify_delay();
    let bot_prefix = config.settings.bot_prefix.clone();
    info!(
        "Starting vendwatch — ally_prefix={:?} refresh={}s notify_delay={:?}",
        ally_prefix, refresh_secs, notify_delay,
    );

    let resolver: Arc<dyn ItemResolver> = match &config.settings.item_database {
        Some(path) => match ItemDatabase::load(Path::new(path)) {
            Ok(db) => {
                info!("Loaded {} items from {path}", db.len());
                Arc::new(db)
            }
            Err(e) => {
                warn!("Failed to load item database: {e} — using id placeholders");
                Arc::new(ItemDatabase::empty())
            }
        },
        None => Arc::new(ItemDatabase::empty()),
    };

    let pairing = FilePairing::new(
        &config.pairing.credentials_path,
        config.pairing.refresh_url.clone(),
    );
    if pairing.load().await?.is_none() {
        anyhow::bail!(
            "no server paired — run the pairing flow and point [pairing].credentials_path at its output"
        );
    }

    let started_at = Utc::now();
    let (chat_tx, mut chat_rx) = mpsc::unbounded_channel::<TeamMessage>();
    let manager = manager::spawn(
        Arc::new(WsConnector),
        Arc::new(pairing),
        ManagerConfig::default(),
        chat_tx,
    );
    manager.start().await;

    let intel = MarketIntel::new(
        resolver,
        ally_prefix,
        bot_prefix.clone(),
        config.settings.sweep_horizon_cycles,
    );

    if args.once {
        wait_until_connected(&manager, Duration::from_secs(60)).await?;
        let session = manager
            .session()
            .context("no live session after connecting")?;
        let map_size = manager.status().server_info.as_ref().map(|i| i.map_size);
        let report = intel
            .run_cycle(&session, CycleTrigger::Startup, map_size)
            .await?;
        reporter::report_cycle(&report);
        manager.shutdown().await;
        return Ok(());
    }

    let mut refresh = tokio::time::interval(Duration::from_secs(refresh_secs));
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut status_rx = manager.watch_status();
    let mut was_connected = false;
    let mut chat_lines_sent: u64 = 0;

    info!("Entering watch loop (interval: {refresh_secs}s). Press Ctrl+C to stop.");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    warn!("connection manager stopped");
                    break;
                }
                let connected = status_rx.borrow_and_update().connected;
                if connected && !was_connected {
                    // Fresh link: refresh right away instead of waiting out
                    // the current interval.
                    let sent = run_cycle_and_announce(
                        &manager, &intel, notify_delay, CycleTrigger::Startup,
                    )
                    .await;
                    chat_lines_sent += sent.unwrap_or(0);
                    refresh.reset();
                }
                was_connected = connected;
            }
            _ = refresh.tick() => {
                let sent = run_cycle_and_announce(
                    &manager, &intel, notify_delay, CycleTrigger::Scheduled,
                )
                .await;
                chat_lines_sent += sent.unwrap_or(0);
            }
            Some(msg) = chat_rx.recv() => {
                chat_lines_sent += handle_chat(&manager, &intel, &bot_prefix, notify_delay, msg).await;
            }
        }
    }

    manager.shutdown().await;

    let stats = intel.stats();
    let summary = RunSummary {
        started_at,
        finished_at: Utc::now(),
        cycles: stats.cycles,
        undercuts_announced: stats.undercuts_announced,
        depletion_events: stats.depletion_events,
        chat_lines_sent,
    };
    reporter::report_run_summary(&summary);

    Ok(())
}

/// One refresh cycle: fetch, report, announce whatever is new.
///
/// Returns the number of chat lines sent, or `None` when the cycle was
/// skipped or failed (the next tick simply tries again).
async fn run_cycle_and_announce(
    manager: &ManagerHandle,
    intel: &MarketIntel,
    notify_delay: Duration,
    trigger: CycleTrigger,
) -> Option<u64> {
    let status = manager.status();
    if !status.connected {
        debug!("skipping refresh; not connected");
        return None;
    }
    let session = manager.session()?;
    let map_size = status.server_info.as_ref().map(|i| i.map_size);

    match intel.run_cycle(&session, trigger, map_size).await {
        Ok(report) => {
            reporter::report_cycle(&report);
            let sent = if report.lines.is_empty() {
                0
            } else {
                notify::dispatch_sequential(&session, &report.lines, notify_delay).await as u64
            };
            Some(sent)
        }
        Err(e) => {
            if matches!(
                e.downcast_ref::<SessionError>(),
                Some(SessionError::InvalidSession)
            ) {
                manager.note_invalid_session();
            }
            warn!("Refresh cycle failed: {e}");
            None
        }
    }
}

/// React to one inbound team-chat message. Replies are answered from
/// cached state so a summary works even moments after a disconnect.
async fn handle_chat(
    manager: &ManagerHandle,
    intel: &MarketIntel,
    bot_prefix: &str,
    notify_delay: Duration,
    msg: TeamMessage,
) -> u64 {
    // Never react to our own announcements echoed back by the server.
    if msg.message.starts_with(bot_prefix) {
        return 0;
    }
    let Some(command) = parse_command(&msg.message) else {
        return 0;
    };
    info!(sender = %msg.sender, ?command, "chat command received");

    let map_size = manager.status().server_info.as_ref().map(|i| i.map_size);
    let lines = match command {
        ChatCommand::Undercut => intel.undercut_summary(map_size),
        ChatCommand::Stock => intel.stock_summary(map_size),
    };

    let Some(session) = manager.session() else {
        warn!("not connected; dropping command reply");
        return 0;
    };
    notify::dispatch_sequential(&session, &lines, notify_delay).await as u64
}

/// Block until the manager reports a live connection or the timeout ends.
async fn wait_until_connected(manager: &ManagerHandle, timeout: Duration) -> Result<()> {
    let mut status_rx = manager.watch_status();
    tokio::time::timeout(timeout, async {
        loop {
            if status_rx.borrow_and_update().connected {
                return;
            }
            if status_rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("timed out waiting for the companion server connection"))?;
    Ok(())
}
