//! SLCP wire protocol: envelope variants, peer records, notifications.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use uuid::Uuid;

/// Maximum datagram payload before fragmentation kicks in.
pub const DATAGRAM_BOUND: usize = 512;

/// The bulk side-channel listens on the data port plus this offset.
pub const BULK_PORT_OFFSET: u16 = 100;

/// A chat participant: handle plus reachable endpoint. Handle is the natural key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub handle: String,
    pub ip: IpAddr,
    pub port: u16,
}

impl Peer {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// All wire envelope types. Encoding is space-delimited text; see wire module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Discovery: advertise presence on the broadcast channel.
    Join { handle: String, port: u16 },
    /// Graceful leave.
    Leave { handle: String },
    /// Ask everyone who they know; answered unicast with KnownUsers.
    Who,
    /// Directory snapshot, sent unicast to the WHO requester.
    KnownUsers { entries: Vec<Peer> },
    /// Chat text on the data channel.
    Message {
        sender: String,
        target: String,
        text: String,
    },
    /// Announces an incoming image transfer on the bulk side-channel.
    ImageHeader {
        sender: String,
        name: String,
        size: u64,
    },
    /// One fragment of an oversized serialized envelope.
    Chunk {
        message_id: Uuid,
        index: u32,
        total: u32,
        payload: Vec<u8>,
    },
    /// Internal: resolve a handle to an endpoint.
    GetPeer { target: String },
    /// Internal response to GetPeer.
    Found { target: String, peer: Peer },
    /// Internal response to GetPeer: no such handle.
    NotFound { target: String },
}

/// Inbound events surfaced to the output boundary (CLI/GUI front ends).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    PeerJoined { handle: String },
    PeerLeft { handle: String },
    Message { sender: String, text: String },
    /// A peer announced an image transfer (header seen on the data channel).
    ImageAnnounced {
        sender: String,
        name: String,
        size: u64,
    },
    /// An image arrived over the bulk side-channel and was written to disk.
    ImageReceived { sender: String, path: PathBuf },
    /// A bulk transfer failed; the user must re-initiate.
    TransferFailed { peer: String, reason: String },
    /// A partial fragment set was evicted after the inactivity window.
    ReassemblyExpired { message_id: Uuid },
}
