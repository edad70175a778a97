//! SLCP protocol reference implementation.
//! No I/O here; the daemon crate owns sockets and drives these types.

pub mod autoreply;
pub mod directory;
pub mod fragment;
pub mod protocol;
pub mod wire;

pub use autoreply::AutoreplyPolicy;
pub use directory::Directory;
pub use fragment::{fragment, Accept, Reassembler};
pub use protocol::{Envelope, Notification, Peer, BULK_PORT_OFFSET, DATAGRAM_BOUND};
pub use wire::{encode_datagram, parse_datagram, BulkRecord, WireError};
