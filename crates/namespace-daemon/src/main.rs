//! namespace-daemon: keeps the unified file namespace current for one user.
//!
//! Polls the file/device service, rebuilds the namespace when local files
//! change, and applies relay frames to in-flight transfers.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use namespace_core::channel::RelayChannel;
use namespace_core::events::CoreEvent;
use namespace_core::service::FileService;
use namespace_core::transfer::FrameOutcome;
use namespace_core::Engine;
use namespace_daemon::{Args, Config, FileWatcher, HttpFileService, RelayClient, RelayEvent};

/// Log engine events; the daemon has no other consumer for them.
fn log_event(event: CoreEvent) {
    match event {
        CoreEvent::TaskChanged { task } => {
            debug!("Task {} {:?} {}%: {}", task.task_id, task.status, task.progress, task.message)
        }
        CoreEvent::TransferChanged { record } => debug!(
            "Transfer {} {:?} {:.0}%",
            record.filename, record.status, record.progress
        ),
        CoreEvent::FolderChanged { folder, removed } => {
            info!("Sync folder {} (removed: {}, progress {:.0})", folder.path, removed, folder.progress)
        }
        CoreEvent::DevicesScored { count, .. } => debug!("Scored {} device(s)", count),
        CoreEvent::NamespaceRebuilt { generation, nodes, .. } => {
            info!("Namespace rebuilt (generation {}, {} nodes)", generation, nodes)
        }
        CoreEvent::NotificationsChanged { .. } => info!("Notifications changed"),
    }
}

/// Refresh devices, then rebuild the namespace with the new scores.
async fn refresh(engine: Arc<Engine>) {
    engine.refresh_devices().await;
    engine.rebuild_namespace().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,namespace_daemon=debug"
    } else {
        "info,namespace_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_args(args)?;

    info!("Starting namespace-daemon");
    info!("Service: {}", config.api_url);
    info!("Relay: {}", config.relay_url);
    info!("Watch root: {:?}", config.watch_root);

    let service: Arc<dyn FileService> = Arc::new(HttpFileService::new(config.api_url.clone()));
    let (relay, mut relay_rx) = RelayClient::start(config.relay_url.clone(), config.reconnect.clone());
    let channel: Arc<dyn RelayChannel> = relay.clone();
    let engine = Arc::new(Engine::new(config.engine.clone(), service, channel)?);
    let _logging = engine.events().subscribe(log_event);

    let mut watcher = FileWatcher::new(config.watch_root.clone())?;
    info!("File watcher started");

    let mut poll = tokio::time::interval(config.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Daemon running. Press Ctrl+C to stop.");

    // Main event loop
    loop {
        tokio::select! {
            // Periodic refresh; the first tick fires immediately
            _ = poll.tick() => {
                tokio::spawn(refresh(Arc::clone(&engine)));
            }

            // Local changes: rebuild without waiting for the next poll
            Some(_) = watcher.event_rx().recv() => {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    engine.on_file_changed().await;
                });
            }

            Some(event) = relay_rx.recv() => {
                match event {
                    RelayEvent::Connected => info!("Relay connected"),
                    RelayEvent::Disconnected => warn!("Relay disconnected"),
                    RelayEvent::Closed => warn!("Relay closed; transfers unavailable"),
                    RelayEvent::Frame(frame) => {
                        if engine.handle_frame(frame) == FrameOutcome::Ignored {
                            debug!("Relay frame ignored");
                        }
                    }
                }
            }

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    relay.close().await;
    info!("Shutting down");
    Ok(())
}
