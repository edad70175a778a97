//! Transport dispatcher: owns the UDP sockets, multiplexes reads across the
//! data and broadcast channels, classifies inbound datagrams, and serializes
//! outbound commands, fragmenting anything over the datagram bound.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use slcp_core::fragment::DEFAULT_REASSEMBLY_WINDOW;
use slcp_core::wire::{encode_datagram, parse_datagram};
use slcp_core::{fragment, Accept, AutoreplyPolicy, Envelope, Notification, Reassembler, DATAGRAM_BOUND};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::directory::DirectoryHandle;
use crate::discovery::Discovery;

const RECV_BUFFER: usize = 65536;
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const SEND_RETRIES: u32 = 5;
const SEND_BACKOFF: Duration = Duration::from_millis(50);

/// Outbound command: serialized by the dispatcher, fragmented when needed.
#[derive(Debug)]
pub enum Outbound {
    /// Send to the well-known discovery port on the broadcast address.
    Broadcast(Envelope),
    /// Send to one specific endpoint.
    Unicast(Envelope, SocketAddr),
}

pub struct Dispatcher {
    data_socket: UdpSocket,
    bcast_socket: UdpSocket,
    broadcast_dest: SocketAddr,
    self_handle: String,
    discovery: Discovery,
    directory: DirectoryHandle,
    autoreply: AutoreplyPolicy,
    reassembler: Reassembler,
    notifications: mpsc::Sender<Notification>,
    outbound_rx: mpsc::Receiver<Outbound>,
}

enum Event {
    Data(io::Result<(usize, SocketAddr)>),
    Bcast(io::Result<(usize, SocketAddr)>),
    Outbound(Option<Outbound>),
    Sweep,
}

impl Dispatcher {
    pub fn new(
        cfg: &Config,
        directory: DirectoryHandle,
        notifications: mpsc::Sender<Notification>,
        outbound_rx: mpsc::Receiver<Outbound>,
    ) -> io::Result<Self> {
        let data_socket = bind_udp(cfg.port)?;
        let bcast_socket = bind_udp(cfg.whoisport)?;
        let discovery = Discovery::new(
            cfg.handle.clone(),
            directory.clone(),
            notifications.clone(),
        );
        Ok(Self {
            data_socket,
            bcast_socket,
            broadcast_dest: SocketAddr::new(Ipv4Addr::BROADCAST.into(), cfg.whoisport),
            self_handle: cfg.handle.clone(),
            discovery,
            directory,
            autoreply: AutoreplyPolicy::new(cfg.inactive, cfg.autoreply.clone()),
            reassembler: Reassembler::new(DEFAULT_REASSEMBLY_WINDOW),
            notifications,
            outbound_rx,
        })
    }

    /// Local address of the data socket (ephemeral ports resolve here).
    pub fn data_addr(&self) -> io::Result<SocketAddr> {
        self.data_socket.local_addr()
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut data_buf = vec![0u8; RECV_BUFFER];
        let mut bcast_buf = vec![0u8; RECV_BUFFER];
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            let event = tokio::select! {
                r = self.data_socket.recv_from(&mut data_buf) => Event::Data(r),
                r = self.bcast_socket.recv_from(&mut bcast_buf) => Event::Bcast(r),
                cmd = self.outbound_rx.recv() => Event::Outbound(cmd),
                _ = sweep.tick() => Event::Sweep,
            };
            match event {
                Event::Data(Ok((n, from))) => {
                    let bytes = data_buf[..n].to_vec();
                    self.handle_datagram(&bytes, from).await;
                }
                Event::Bcast(Ok((n, from))) => {
                    let bytes = bcast_buf[..n].to_vec();
                    self.handle_datagram(&bytes, from).await;
                }
                Event::Data(Err(e)) | Event::Bcast(Err(e)) => {
                    warn!(error = %e, "datagram receive failed");
                }
                Event::Outbound(Some(cmd)) => self.send(cmd).await,
                // All senders gone: the daemon is shutting down.
                Event::Outbound(None) => break,
                Event::Sweep => self.sweep_reassembly().await,
            }
        }
        Ok(())
    }

    async fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddr) {
        let env = match parse_datagram(bytes) {
            Ok(env) => env,
            Err(e) => {
                debug!(%from, error = %e, "dropping malformed datagram");
                return;
            }
        };
        // A completed reassembly yields an inner envelope that is dispatched
        // again, so a fragmented MSG takes the same path as a plain one.
        let mut next = Some(env);
        while let Some(env) = next.take() {
            next = self.dispatch(env, from).await;
        }
    }

    async fn dispatch(&mut self, env: Envelope, from: SocketAddr) -> Option<Envelope> {
        match env {
            env @ (Envelope::Join { .. }
            | Envelope::Leave { .. }
            | Envelope::Who
            | Envelope::KnownUsers { .. }) => match self.discovery.handle(env, from).await {
                // Replies are transmitted here, not queued through the
                // outbound channel this loop is the sole consumer of.
                Ok(Some((reply, dest))) => self.send(Outbound::Unicast(reply, dest)).await,
                Ok(None) => {}
                Err(e) => warn!(error = %e, "discovery handler failed"),
            },
            Envelope::Message {
                sender,
                target: _,
                text,
            } => {
                if sender == self.self_handle {
                    return None;
                }
                let _ = self
                    .notifications
                    .send(Notification::Message {
                        sender: sender.clone(),
                        text,
                    })
                    .await;
                if self.autoreply.inactive {
                    let resolved = self.directory.lookup(&sender).await.ok().flatten();
                    if let Some((dest, reply)) =
                        self.autoreply
                            .decide(&self.self_handle, &sender, resolved.as_ref(), from)
                    {
                        debug!(%sender, %dest, "autoreplying");
                        self.send(Outbound::Unicast(reply, dest)).await;
                    }
                }
            }
            Envelope::ImageHeader { sender, name, size } => {
                let _ = self
                    .notifications
                    .send(Notification::ImageAnnounced { sender, name, size })
                    .await;
            }
            Envelope::Chunk {
                message_id,
                index,
                total,
                payload,
            } => match self
                .reassembler
                .accept(message_id, index, total, payload, Instant::now())
            {
                Ok(Accept::Complete(bytes)) => match parse_datagram(&bytes) {
                    Ok(inner) => return Some(inner),
                    Err(e) => warn!(%message_id, error = %e, "reassembled payload is malformed"),
                },
                Ok(_) => {}
                Err(e) => warn!(%message_id, error = %e, "chunk rejected"),
            },
            Envelope::GetPeer { target } => {
                let reply = match self.directory.lookup(&target).await {
                    Ok(Some(peer)) => Envelope::Found { target, peer },
                    Ok(None) => Envelope::NotFound { target },
                    Err(_) => return None,
                };
                self.send(Outbound::Unicast(reply, from)).await;
            }
            env @ (Envelope::Found { .. } | Envelope::NotFound { .. }) => {
                // Local sends resolve through the directory handle, so these
                // only arrive unsolicited.
                debug!(?env, "directory query response");
            }
        }
        None
    }

    async fn sweep_reassembly(&mut self) {
        for message_id in self.reassembler.sweep_expired(Instant::now()) {
            warn!(%message_id, "reassembly buffer expired");
            let _ = self
                .notifications
                .send(Notification::ReassemblyExpired { message_id })
                .await;
        }
    }

    /// Serialize and transmit one outbound command, splitting the datagram
    /// into chunks when it exceeds the bound. Each chunk keeps the original
    /// envelope's addressing.
    async fn send(&self, cmd: Outbound) {
        let (env, dest) = match cmd {
            Outbound::Broadcast(env) => (env, self.broadcast_dest),
            Outbound::Unicast(env, addr) => (env, addr),
        };
        let bytes = match encode_datagram(&env) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "refusing to send unencodable envelope");
                return;
            }
        };
        if bytes.len() <= DATAGRAM_BOUND {
            self.transmit(&bytes, dest).await;
            return;
        }
        debug!(len = bytes.len(), %dest, "fragmenting oversized envelope");
        for chunk in fragment(&bytes, DATAGRAM_BOUND) {
            match encode_datagram(&chunk) {
                Ok(chunk_bytes) => self.transmit(&chunk_bytes, dest).await,
                Err(e) => warn!(error = %e, "chunk encode failed"),
            }
        }
    }

    /// Transmit with bounded retry: local buffer pressure backs off briefly
    /// instead of surfacing immediately.
    async fn transmit(&self, bytes: &[u8], dest: SocketAddr) {
        for attempt in 0..SEND_RETRIES {
            match self.data_socket.send_to(bytes, dest).await {
                Ok(_) => return,
                Err(e) if is_transient(&e) && attempt + 1 < SEND_RETRIES => {
                    debug!(%dest, error = %e, attempt, "transient send failure, backing off");
                    tokio::time::sleep(SEND_BACKOFF * (attempt + 1)).await;
                }
                Err(e) => {
                    warn!(%dest, error = %e, "datagram send failed");
                    return;
                }
            }
        }
        warn!(%dest, "datagram send retries exhausted");
    }
}

fn is_transient(e: &io::Error) -> bool {
    // ENOBUFS (105 Linux, 55 BSD/macOS): transmit buffer exhaustion.
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::OutOfMemory)
        || matches!(e.raw_os_error(), Some(105) | Some(55))
}

/// Reuse-address is set before bind so several nodes on one host can share
/// the well-known discovery port.
fn bind_udp(port: u16) -> io::Result<UdpSocket> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    sock.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    let sock: std::net::UdpSocket = sock.into();
    sock.set_broadcast(true)?;
    sock.set_nonblocking(true)?;
    UdpSocket::from_std(sock)
}
