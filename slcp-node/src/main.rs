// SLCP node: discovery, dispatcher, and bulk image channel daemon.

use std::time::Duration;

use slcp_core::{Notification, BULK_PORT_OFFSET};
use slcp_node::{bulk, config, discovery, spawn_directory, Dispatcher, NodeHandle};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);
const CHANNEL_DEPTH: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("slcp-node {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    info!(
        handle = %cfg.handle,
        port = cfg.port,
        whoisport = cfg.whoisport,
        "slcp node starting"
    );

    let (notif_tx, notif_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_DEPTH);

    let peer_timeout =
        (cfg.peer_timeout_secs > 0).then(|| Duration::from_secs(cfg.peer_timeout_secs));
    let directory = spawn_directory(peer_timeout, notif_tx.clone());

    let dispatcher = Dispatcher::new(&cfg, directory.clone(), notif_tx.clone(), outbound_rx)?;
    tokio::spawn(async move {
        if let Err(e) = dispatcher.run().await {
            error!(error = %e, "dispatcher exited");
        }
    });

    let bulk_listener =
        TcpListener::bind(("0.0.0.0", cfg.port.saturating_add(BULK_PORT_OFFSET))).await?;
    let imagepath = cfg.imagepath.clone();
    let bulk_notif = notif_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = bulk::run_listener(bulk_listener, imagepath, bulk_notif).await {
            error!(error = %e, "bulk listener exited");
        }
    });

    tokio::spawn(discovery::announce_loop(
        outbound_tx.clone(),
        directory.clone(),
        cfg.handle.clone(),
        cfg.port,
        ANNOUNCE_INTERVAL,
    ));

    tokio::spawn(consume_notifications(notif_rx));

    let node = NodeHandle::new(
        cfg.handle.clone(),
        cfg.port,
        directory.clone(),
        outbound_tx.clone(),
    );
    node.request_who().await.ok();

    shutdown_signal().await?;
    info!("shutting down");
    node.leave().await.ok();
    // Give the LEAVE broadcast a moment to drain before the sockets close.
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

/// Output boundary: front ends attach here; the daemon itself just logs.
async fn consume_notifications(mut rx: mpsc::Receiver<Notification>) {
    while let Some(n) = rx.recv().await {
        match n {
            Notification::PeerJoined { handle } => info!(%handle, "joined the chat"),
            Notification::PeerLeft { handle } => info!(%handle, "left the chat"),
            Notification::Message { sender, text } => info!(%sender, %text, "message"),
            Notification::ImageAnnounced { sender, name, size } => {
                info!(%sender, %name, size, "incoming image announced")
            }
            Notification::ImageReceived { sender, path } => {
                info!(%sender, path = %path.display(), "image received")
            }
            Notification::TransferFailed { peer, reason } => {
                warn!(%peer, %reason, "image transfer failed")
            }
            Notification::ReassemblyExpired { message_id } => {
                warn!(%message_id, "gave up reassembling fragmented message")
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
