//! qplay - headless queue player
//!
//! Queues local files, plays them back to back through a clock-driven sink
//! and prints lifecycle events. With `--state-file` the queue (including the
//! current entry and its position) survives an interrupted run.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use qplay_common::human_time::{format_human_time, format_progress};
use qplay_engine::config::{ConfigOverrides, EngineConfig};
use qplay_engine::entry::Entry;
use qplay_engine::local::{ClockSink, LocalFileResolver};
use qplay_engine::player::PlayStatus;
use qplay_engine::store::{JsonFileStore, Store};
use qplay_engine::{EventKind, PlayerEvent, Session};
use tokio::signal;
use tokio::sync::{broadcast, Notify};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for qplay
#[derive(Parser, Debug)]
#[command(name = "qplay")]
#[command(about = "Queue-driven media player engine (headless demo)")]
#[command(version)]
struct Args {
    /// Files to queue, in order
    files: Vec<String>,

    /// Config file (overrides QPLAY_CONFIG and the platform config file)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Resolve relative file names against this folder
    #[arg(short, long, env = "QPLAY_ROOT")]
    root: Option<PathBuf>,

    /// Folder downloaded media is cached in
    #[arg(long, env = "QPLAY_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Number of leading queue entries kept pre-cached
    #[arg(long)]
    precache_depth: Option<usize>,

    /// Starting volume (0.0-1.0)
    #[arg(long)]
    volume: Option<f32>,

    /// Never delete cached files
    #[arg(long)]
    keep_downloads: bool,

    /// Play at most this many seconds of each entry
    #[arg(long)]
    clip_seconds: Option<f64>,

    /// Save the queue here on exit and restore it on start
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Shuffle the queue before playing
    #[arg(long)]
    shuffle: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = EngineConfig::load(
        args.config.as_deref(),
        ConfigOverrides {
            cache_dir: args.cache_dir.clone(),
            precache_depth: args.precache_depth,
            default_volume: args.volume,
            keep_downloads: args.keep_downloads.then_some(true),
        },
    )
    .context("Failed to load configuration")?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting qplay");
    info!("Cache folder: {}", config.cache_dir.display());

    let resolver = Arc::new(match &args.root {
        Some(root) => LocalFileResolver::with_root(root),
        None => LocalFileResolver::new(),
    });
    let clip = args
        .clip_seconds
        .map(qplay_common::time::seconds_to_duration)
        .filter(|d| !d.is_zero());
    let sink = Arc::new(ClockSink::new(clip));

    let store = args.state_file.clone().map(JsonFileStore::new);
    let saved = match &store {
        Some(store) => store.load().await.context("Failed to load saved state")?,
        None => None,
    };

    let session = match &saved {
        Some(snapshot) => Session::restore(&config, resolver, sink, snapshot),
        None => Session::new(&config, resolver, sink),
    };

    let printer = tokio::spawn(print_events(session.events().subscribe()));

    let finished = Arc::new(Notify::new());
    {
        let finished = Arc::clone(&finished);
        session.events().once(EventKind::Stop, move |_| {
            finished.notify_one();
            Ok(())
        });
    }

    let playlist = session.playlist();
    if !args.files.is_empty() {
        let entries: Vec<Arc<Entry>> = args
            .files
            .iter()
            .map(|file| Entry::new(file.as_str(), Some("cli".to_string())))
            .collect();
        playlist
            .add_entries(entries)
            .context("Failed to queue files")?;
    }
    if args.shuffle {
        playlist.shuffle().context("Failed to shuffle queue")?;
    }

    let ahead = playlist.estimate_time_until(playlist.len() + 1);
    info!(
        "{} entries queued, total {}",
        playlist.len(),
        ahead.display()
    );

    match session.player().play().await.context("Failed to start playback")? {
        PlayStatus::WaitingForEntries => {
            info!("Nothing to play");
            finish(session, store).await?;
            printer.abort();
            return Ok(());
        }
        status => info!("Playback: {:?}", status),
    }

    tokio::select! {
        _ = finished.notified() => info!("Queue finished"),
        _ = shutdown_signal() => {
            let player = session.player();
            info!(
                "Interrupted at {}",
                format_progress(
                    player.progress().await,
                    player.current_entry().await.and_then(|e| e.duration()),
                )
            );
        }
    }

    finish(session, store).await?;
    printer.abort();
    Ok(())
}

/// Persist the queue (if requested) and tear the session down
async fn finish(session: Session, store: Option<JsonFileStore>) -> Result<()> {
    if let Some(store) = store {
        let snapshot = session.player().snapshot().await;
        store
            .save(&snapshot)
            .await
            .with_context(|| format!("Failed to save state to {}", store.path().display()))?;
    }
    session.close().await;
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<PlayerEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => println!("{}", describe(&event)),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Event printer lagged, {} events missed", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn describe(event: &PlayerEvent) -> String {
    let length = |seconds: Option<f64>| {
        seconds
            .map(|s| format_human_time(qplay_common::time::seconds_to_duration(s)))
            .unwrap_or_else(|| "?".to_string())
    };

    match event {
        PlayerEvent::EntryAdded {
            playlist,
            entry,
            position,
            ..
        } => format!("+ [{}#{}] {}", playlist, position, entry.title),
        PlayerEvent::Play { entry, .. } => {
            format!("> {} ({})", entry.title, length(entry.duration_seconds))
        }
        PlayerEvent::Pause { entry, .. } => format!("|| {}", entry.title),
        PlayerEvent::Resume { entry, .. } => format!(">> {}", entry.title),
        PlayerEvent::FinishedPlaying { entry, .. } => format!("# {}", entry.title),
        PlayerEvent::Stop { .. } => "[] queue empty".to_string(),
        PlayerEvent::Error { entry, cause, .. } => match entry {
            Some(entry) => format!("! {}: {:?}", entry.title, cause),
            None => format!("! {:?}", cause),
        },
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
