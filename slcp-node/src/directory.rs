//! Directory service: the single owning task for the peer directory.
//!
//! Everyone else holds a [`DirectoryHandle`] and talks to the service over a
//! bounded channel with oneshot replies; there is no shared mutation.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use slcp_core::{Directory, Notification, Peer};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

const COMMAND_DEPTH: usize = 64;
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

enum Command {
    Register {
        handle: String,
        ip: IpAddr,
        port: u16,
        reply: oneshot::Sender<bool>,
    },
    Unregister {
        handle: String,
        reply: oneshot::Sender<bool>,
    },
    Lookup {
        handle: String,
        reply: oneshot::Sender<Option<Peer>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<Peer>>,
    },
    Merge {
        entries: Vec<Peer>,
        reply: oneshot::Sender<Vec<Peer>>,
    },
}

/// The directory service task has exited (daemon shutdown).
#[derive(Debug, thiserror::Error)]
#[error("directory service closed")]
pub struct DirectoryClosed;

/// Cloneable request/response interface to the directory service.
#[derive(Clone)]
pub struct DirectoryHandle {
    tx: mpsc::Sender<Command>,
}

impl DirectoryHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, DirectoryClosed> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).await.map_err(|_| DirectoryClosed)?;
        rx.await.map_err(|_| DirectoryClosed)
    }

    /// Insert or overwrite; returns true iff the handle was newly seen.
    pub async fn register(
        &self,
        handle: &str,
        ip: IpAddr,
        port: u16,
    ) -> Result<bool, DirectoryClosed> {
        let handle = handle.to_string();
        self.request(|reply| Command::Register {
            handle,
            ip,
            port,
            reply,
        })
        .await
    }

    pub async fn unregister(&self, handle: &str) -> Result<bool, DirectoryClosed> {
        let handle = handle.to_string();
        self.request(|reply| Command::Unregister { handle, reply }).await
    }

    pub async fn lookup(&self, handle: &str) -> Result<Option<Peer>, DirectoryClosed> {
        let handle = handle.to_string();
        self.request(|reply| Command::Lookup { handle, reply }).await
    }

    pub async fn snapshot(&self) -> Result<Vec<Peer>, DirectoryClosed> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Additive merge of secondhand entries; returns those actually added.
    pub async fn merge(&self, entries: Vec<Peer>) -> Result<Vec<Peer>, DirectoryClosed> {
        self.request(|reply| Command::Merge { entries, reply }).await
    }
}

/// Spawn the directory service. When `peer_timeout` is set, peers not heard
/// from within it are removed and surfaced as `PeerLeft` notifications.
pub fn spawn_directory(
    peer_timeout: Option<Duration>,
    notifications: mpsc::Sender<Notification>,
) -> DirectoryHandle {
    let (tx, rx) = mpsc::channel(COMMAND_DEPTH);
    tokio::spawn(run_service(rx, peer_timeout, notifications));
    DirectoryHandle { tx }
}

async fn run_service(
    mut rx: mpsc::Receiver<Command>,
    peer_timeout: Option<Duration>,
    notifications: mpsc::Sender<Notification>,
) {
    let mut directory = Directory::new();
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                handle_command(&mut directory, cmd);
            }
            _ = sweep.tick() => {
                let Some(timeout) = peer_timeout else { continue };
                for peer in directory.sweep_expired(Instant::now(), timeout) {
                    info!(handle = %peer.handle, "peer expired without LEAVE");
                    let _ = notifications
                        .send(Notification::PeerLeft { handle: peer.handle })
                        .await;
                }
            }
        }
    }
    debug!("directory service stopped");
}

fn handle_command(directory: &mut Directory, cmd: Command) {
    match cmd {
        Command::Register {
            handle,
            ip,
            port,
            reply,
        } => {
            let _ = reply.send(directory.register(&handle, ip, port, Instant::now()));
        }
        Command::Unregister { handle, reply } => {
            let _ = reply.send(directory.unregister(&handle));
        }
        Command::Lookup { handle, reply } => {
            let _ = reply.send(directory.lookup(&handle));
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(directory.snapshot());
        }
        Command::Merge { entries, reply } => {
            let _ = reply.send(directory.merge(&entries, Instant::now()));
        }
    }
}
