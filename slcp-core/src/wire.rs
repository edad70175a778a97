//! Datagram codec (space-delimited text commands) and bulk framing
//! (4 bytes LE length prefix + bincode record) for the image side-channel.

use std::net::IpAddr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{Envelope, Peer};

const LEN_SIZE: usize = 4;
const MAX_BULK_FRAME: u32 = 64 * 1024 * 1024; // 64 MiB

/// Error parsing or encoding a datagram. Malformed input is recoverable:
/// the dispatcher logs and drops, it never crashes.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("empty datagram")]
    Empty,
    #[error("datagram is not valid UTF-8")]
    NotUtf8,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid number in field: {0}")]
    InvalidNumber(&'static str),
    #[error("invalid address in field: {0}")]
    InvalidAddr(&'static str),
    #[error("invalid chunk payload encoding")]
    InvalidPayload,
    #[error("handle contains whitespace: {0:?}")]
    InvalidHandle(String),
}

fn check_handle(handle: &str) -> Result<(), WireError> {
    if handle.is_empty() || handle.chars().any(char::is_whitespace) {
        return Err(WireError::InvalidHandle(handle.to_string()));
    }
    Ok(())
}

/// Encode an envelope as one text datagram.
pub fn encode_datagram(env: &Envelope) -> Result<Vec<u8>, WireError> {
    let line = match env {
        Envelope::Join { handle, port } => {
            check_handle(handle)?;
            format!("JOIN {handle} {port}")
        }
        Envelope::Leave { handle } => {
            check_handle(handle)?;
            format!("LEAVE {handle}")
        }
        Envelope::Who => "WHO".to_string(),
        Envelope::KnownUsers { entries } => {
            let mut line = String::from("KNOWNUSERS");
            for p in entries {
                check_handle(&p.handle)?;
                line.push_str(&format!(" {} {} {}", p.handle, p.ip, p.port));
            }
            line
        }
        Envelope::Message {
            sender,
            target,
            text,
        } => {
            check_handle(sender)?;
            check_handle(target)?;
            format!("MSG {sender} {target} {text}")
        }
        Envelope::ImageHeader { sender, name, size } => {
            check_handle(sender)?;
            check_handle(name)?;
            format!("IMG {sender} {name} {size}")
        }
        Envelope::Chunk {
            message_id,
            index,
            total,
            payload,
        } => {
            let b64 = BASE64.encode(payload);
            format!("CHUNK {} {index} {total} {b64}", message_id.simple())
        }
        Envelope::GetPeer { target } => {
            check_handle(target)?;
            format!("GETPEER {target}")
        }
        Envelope::Found { target, peer } => {
            check_handle(target)?;
            format!("FOUND {target} {} {}", peer.ip, peer.port)
        }
        Envelope::NotFound { target } => {
            check_handle(target)?;
            format!("NOTFOUND {target}")
        }
    };
    Ok(line.into_bytes())
}

/// Parse one datagram into an envelope.
pub fn parse_datagram(bytes: &[u8]) -> Result<Envelope, WireError> {
    let text = std::str::from_utf8(bytes).map_err(|_| WireError::NotUtf8)?;
    let line = text.trim_end_matches(['\r', '\n']);
    let mut head = line.splitn(2, ' ');
    let cmd = match head.next() {
        Some(c) if !c.is_empty() => c,
        _ => return Err(WireError::Empty),
    };
    let rest = head.next().unwrap_or("");

    match cmd {
        "JOIN" => {
            let mut it = rest.split_whitespace();
            let handle = it.next().ok_or(WireError::MissingField("handle"))?;
            let port = parse_port(it.next().ok_or(WireError::MissingField("port"))?)?;
            Ok(Envelope::Join {
                handle: handle.to_string(),
                port,
            })
        }
        "LEAVE" => {
            let handle = rest
                .split_whitespace()
                .next()
                .ok_or(WireError::MissingField("handle"))?;
            Ok(Envelope::Leave {
                handle: handle.to_string(),
            })
        }
        "WHO" => Ok(Envelope::Who),
        "KNOWNUSERS" => Ok(Envelope::KnownUsers {
            entries: parse_peer_triples(rest),
        }),
        "MSG" => {
            let mut it = rest.splitn(3, ' ');
            let sender = non_empty(it.next(), "sender")?;
            let target = non_empty(it.next(), "target")?;
            let text = it.next().ok_or(WireError::MissingField("text"))?;
            Ok(Envelope::Message {
                sender: sender.to_string(),
                target: target.to_string(),
                text: text.to_string(),
            })
        }
        "IMG" => {
            let mut it = rest.split_whitespace();
            let sender = it.next().ok_or(WireError::MissingField("sender"))?;
            let name = it.next().ok_or(WireError::MissingField("name"))?;
            let size = it
                .next()
                .ok_or(WireError::MissingField("size"))?
                .parse::<u64>()
                .map_err(|_| WireError::InvalidNumber("size"))?;
            Ok(Envelope::ImageHeader {
                sender: sender.to_string(),
                name: name.to_string(),
                size,
            })
        }
        "CHUNK" => {
            let mut it = rest.split_whitespace();
            let id = it.next().ok_or(WireError::MissingField("message_id"))?;
            let message_id =
                Uuid::parse_str(id).map_err(|_| WireError::InvalidNumber("message_id"))?;
            let index = parse_u32(it.next().ok_or(WireError::MissingField("index"))?, "index")?;
            let total = parse_u32(it.next().ok_or(WireError::MissingField("total"))?, "total")?;
            let payload = BASE64
                .decode(it.next().ok_or(WireError::MissingField("payload"))?)
                .map_err(|_| WireError::InvalidPayload)?;
            Ok(Envelope::Chunk {
                message_id,
                index,
                total,
                payload,
            })
        }
        "GETPEER" => {
            let target = non_empty(rest.split_whitespace().next(), "target")?;
            Ok(Envelope::GetPeer {
                target: target.to_string(),
            })
        }
        "FOUND" => {
            let mut it = rest.split_whitespace();
            let target = it.next().ok_or(WireError::MissingField("target"))?;
            let ip = parse_ip(it.next().ok_or(WireError::MissingField("ip"))?)?;
            let port = parse_port(it.next().ok_or(WireError::MissingField("port"))?)?;
            Ok(Envelope::Found {
                target: target.to_string(),
                peer: Peer {
                    handle: target.to_string(),
                    ip,
                    port,
                },
            })
        }
        "NOTFOUND" => {
            let target = non_empty(rest.split_whitespace().next(), "target")?;
            Ok(Envelope::NotFound {
                target: target.to_string(),
            })
        }
        other => Err(WireError::UnknownCommand(other.to_string())),
    }
}

fn non_empty<'a>(tok: Option<&'a str>, field: &'static str) -> Result<&'a str, WireError> {
    match tok {
        Some(t) if !t.is_empty() => Ok(t),
        _ => Err(WireError::MissingField(field)),
    }
}

fn parse_port(s: &str) -> Result<u16, WireError> {
    s.parse::<u16>().map_err(|_| WireError::InvalidNumber("port"))
}

fn parse_u32(s: &str, field: &'static str) -> Result<u32, WireError> {
    s.parse::<u32>().map_err(|_| WireError::InvalidNumber(field))
}

fn parse_ip(s: &str) -> Result<IpAddr, WireError> {
    s.parse::<IpAddr>().map_err(|_| WireError::InvalidAddr("ip"))
}

/// KNOWNUSERS carries `handle ip port` triples. Malformed triples from a
/// relay are skipped rather than poisoning the whole report.
fn parse_peer_triples(rest: &str) -> Vec<Peer> {
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    let mut entries = Vec::new();
    for triple in tokens.chunks(3) {
        if triple.len() != 3 {
            break;
        }
        let (Ok(ip), Ok(port)) = (triple[1].parse::<IpAddr>(), triple[2].parse::<u16>()) else {
            continue;
        };
        entries.push(Peer {
            handle: triple[0].to_string(),
            ip,
            port,
        });
    }
    entries
}

/// One image transfer on the bulk side-channel. Exactly one record per
/// connection; the frame length prefix delimits it, never EOF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkRecord {
    pub sender: String,
    pub filename: String,
    pub payload: Vec<u8>,
}

/// Error encoding a bulk record into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum BulkEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("bulk frame too large")]
    TooLarge,
}

/// Error decoding a bulk frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum BulkDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("bulk frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

/// Encode a bulk record into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_bulk_frame(record: &BulkRecord) -> Result<Vec<u8>, BulkEncodeError> {
    let payload = bincode::serialize(record).map_err(BulkEncodeError::Encode)?;
    let len = payload.len() as u32;
    if len > MAX_BULK_FRAME {
        return Err(BulkEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Read the declared frame length from the first 4 bytes.
pub fn bulk_frame_len(header: &[u8; LEN_SIZE]) -> Result<usize, BulkDecodeError> {
    let len = u32::from_le_bytes(*header);
    if len > MAX_BULK_FRAME {
        return Err(BulkDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Decode one bulk frame from the front of `bytes`. Returns the record and
/// the number of bytes consumed.
pub fn decode_bulk_frame(bytes: &[u8]) -> Result<(BulkRecord, usize), BulkDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(BulkDecodeError::NeedMore);
    }
    let len = bulk_frame_len(&[bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(BulkDecodeError::NeedMore);
    }
    let record = decode_bulk_record(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((record, LEN_SIZE + len))
}

/// Decode a bulk record whose length prefix has already been consumed
/// (streaming readers pull the prefix separately via [`bulk_frame_len`]).
pub fn decode_bulk_record(payload: &[u8]) -> Result<BulkRecord, BulkDecodeError> {
    bincode::deserialize(payload).map_err(BulkDecodeError::Decode)
}
