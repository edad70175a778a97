//! Discovery protocol: JOIN/LEAVE/WHO/KNOWNUSERS handling and the periodic
//! presence announcement. All handlers are idempotent under duplicate or
//! reordered broadcast delivery.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use slcp_core::{Envelope, Notification};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::directory::DirectoryHandle;
use crate::dispatcher::Outbound;

/// Handles inbound discovery envelopes and mutates the directory. The only
/// component that writes to it.
pub struct Discovery {
    self_handle: String,
    directory: DirectoryHandle,
    notifications: mpsc::Sender<Notification>,
}

impl Discovery {
    pub fn new(
        self_handle: String,
        directory: DirectoryHandle,
        notifications: mpsc::Sender<Notification>,
    ) -> Self {
        Self {
            self_handle,
            directory,
            notifications,
        }
    }

    /// Returns the reply to transmit, if any. Replies go back to the caller
    /// (the dispatcher) rather than through the outbound queue: the
    /// dispatcher is blocked in this handler, so queueing toward it could
    /// never drain.
    pub async fn handle(
        &self,
        env: Envelope,
        from: SocketAddr,
    ) -> anyhow::Result<Option<(Envelope, SocketAddr)>> {
        match env {
            Envelope::Join { handle, port } => {
                // The advertised port plus the datagram's observed source IP
                // form the endpoint; a direct JOIN always overwrites.
                let new = self.directory.register(&handle, from.ip(), port).await?;
                if new && handle != self.self_handle {
                    info!(%handle, ip = %from.ip(), port, "peer joined");
                    self.notifications
                        .send(Notification::PeerJoined { handle })
                        .await?;
                }
            }
            Envelope::Leave { handle } => {
                let removed = self.directory.unregister(&handle).await?;
                if removed && handle != self.self_handle {
                    info!(%handle, "peer left");
                    self.notifications
                        .send(Notification::PeerLeft { handle })
                        .await?;
                }
            }
            Envelope::Who => {
                // Answer unicast to the requester's observed address, never
                // broadcast, to avoid flooding the discovery channel.
                let entries = self.directory.snapshot().await?;
                debug!(%from, count = entries.len(), "answering WHO");
                return Ok(Some((Envelope::KnownUsers { entries }, from)));
            }
            Envelope::KnownUsers { entries } => {
                // Secondhand report: additive merge only, first-seen wins.
                let added = self.directory.merge(entries).await?;
                for peer in added {
                    if peer.handle != self.self_handle {
                        info!(handle = %peer.handle, "peer learned via KNOWNUSERS");
                        self.notifications
                            .send(Notification::PeerJoined {
                                handle: peer.handle,
                            })
                            .await?;
                    }
                }
            }
            other => debug!(?other, "non-discovery envelope ignored"),
        }
        Ok(None)
    }
}

/// Periodically re-announce presence: refresh our own directory entry and
/// broadcast JOIN so remote liveness timeouts never expire a live peer.
pub async fn announce_loop(
    outbound: mpsc::Sender<Outbound>,
    directory: DirectoryHandle,
    handle: String,
    port: u16,
    interval: Duration,
) {
    let ip = local_ip();
    loop {
        let _ = directory.register(&handle, ip, port).await;
        let join = Envelope::Join {
            handle: handle.clone(),
            port,
        };
        if outbound.send(Outbound::Broadcast(join)).await.is_err() {
            break;
        }
        tokio::time::sleep(interval).await;
    }
}

/// Best-effort local address discovery: a connected UDP socket picks the
/// outbound interface without sending anything.
pub fn local_ip() -> IpAddr {
    let fallback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let Ok(sock) = std::net::UdpSocket::bind(("0.0.0.0", 0)) else {
        return fallback;
    };
    if sock.connect(("8.8.8.8", 80)).is_err() {
        return fallback;
    }
    sock.local_addr().map(|a| a.ip()).unwrap_or(fallback)
}
