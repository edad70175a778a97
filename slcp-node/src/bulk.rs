//! Bulk side-channel: images travel over a dedicated TCP connection to the
//! receiver's data port plus a fixed offset, one connection per transfer.
//! The record is length-prefixed, never EOF-delimited, so a truncated
//! connection is a detectable failure instead of a silently short image.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use slcp_core::wire::{
    bulk_frame_len, decode_bulk_record, encode_bulk_frame, BulkDecodeError, BulkEncodeError,
};
use slcp_core::{BulkRecord, Notification, Peer, BULK_PORT_OFFSET};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum BulkError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Encode(#[from] BulkEncodeError),
    #[error(transparent)]
    Decode(#[from] BulkDecodeError),
    #[error("transfer timed out")]
    Timeout,
}

/// Accept loop for inbound image transfers. Each connection is handled in
/// its own task with an overall timeout; a stalled transfer is abandoned and
/// reported, never retried.
pub async fn run_listener(
    listener: TcpListener,
    imagepath: PathBuf,
    notifications: mpsc::Sender<Notification>,
) -> anyhow::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        debug!(%addr, "bulk connection accepted");
        let dir = imagepath.clone();
        let notif = notifications.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(TRANSFER_TIMEOUT, receive_transfer(stream, &dir)).await {
                Ok(Ok((sender, path))) => {
                    info!(%sender, path = %path.display(), "image received");
                    let _ = notif
                        .send(Notification::ImageReceived { sender, path })
                        .await;
                }
                Ok(Err(e)) => {
                    warn!(%addr, error = %e, "bulk transfer failed");
                    let _ = notif
                        .send(Notification::TransferFailed {
                            peer: addr.to_string(),
                            reason: e.to_string(),
                        })
                        .await;
                }
                Err(_) => {
                    warn!(%addr, "bulk transfer timed out");
                    let _ = notif
                        .send(Notification::TransferFailed {
                            peer: addr.to_string(),
                            reason: BulkError::Timeout.to_string(),
                        })
                        .await;
                }
            }
        });
    }
}

/// Read exactly one length-prefixed record and write its payload to `dir`.
/// Returns the sender handle and the path written.
pub async fn receive_transfer<S: AsyncRead + Unpin>(
    mut stream: S,
    dir: &Path,
) -> Result<(String, PathBuf), BulkError> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let len = bulk_frame_len(&header)?;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    let record = decode_bulk_record(&payload)?;

    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(sanitize_filename(&record.filename));
    tokio::fs::write(&path, &record.payload).await?;
    Ok((record.sender, path))
}

/// Send one image: open a dedicated connection to the peer's bulk port,
/// write one frame, close. Returns the payload size for the announcement
/// header. Failures surface to the caller; the user re-initiates.
pub async fn send_image(peer: &Peer, self_handle: &str, path: &Path) -> Result<u64, BulkError> {
    let payload = tokio::fs::read(path).await?;
    let size = payload.len() as u64;
    let record = BulkRecord {
        sender: self_handle.to_string(),
        filename: source_filename(path),
        payload,
    };
    let frame = encode_bulk_frame(&record)?;

    let addr = SocketAddr::new(peer.ip, peer.port.saturating_add(BULK_PORT_OFFSET));
    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| BulkError::Timeout)??;
    tokio::time::timeout(TRANSFER_TIMEOUT, async {
        stream.write_all(&frame).await?;
        stream.shutdown().await
    })
    .await
    .map_err(|_| BulkError::Timeout)??;
    debug!(%addr, size, "image sent");
    Ok(size)
}

/// Receiver-side defense: never let a remote filename escape the image
/// directory.
fn sanitize_filename(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty() && *s != "..")
        .unwrap_or("image.bin")
        .to_string()
}

fn source_filename(path: &Path) -> String {
    path.file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("image.bin")
        .replace(char::is_whitespace, "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_image_dir() -> PathBuf {
        std::env::temp_dir().join(format!("slcp-bulk-test-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn transfer_roundtrip_over_duplex() {
        let (mut tx, rx) = tokio::io::duplex(1 << 16);
        let record = BulkRecord {
            sender: "alice".into(),
            filename: "cat.png".into(),
            payload: (0u32..10_000).map(|i| i as u8).collect(),
        };
        let frame = encode_bulk_frame(&record).unwrap();
        let writer = tokio::spawn(async move {
            tx.write_all(&frame).await.unwrap();
        });

        let dir = temp_image_dir();
        let (sender, path) = receive_transfer(rx, &dir).await.unwrap();
        writer.await.unwrap();

        assert_eq!(sender, "alice");
        assert_eq!(path, dir.join("cat.png"));
        let written = tokio::fs::read(&path).await.unwrap();
        assert_eq!(written, record.payload);
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn truncated_transfer_is_an_error() {
        let (mut tx, rx) = tokio::io::duplex(1 << 16);
        let record = BulkRecord {
            sender: "alice".into(),
            filename: "cat.png".into(),
            payload: vec![1u8; 4096],
        };
        let frame = encode_bulk_frame(&record).unwrap();
        let half = frame.len() / 2;
        let writer = tokio::spawn(async move {
            tx.write_all(&frame[..half]).await.unwrap();
            // Dropping tx closes the stream mid-record.
        });

        let dir = temp_image_dir();
        let result = receive_transfer(rx, &dir).await;
        writer.await.unwrap();
        assert!(matches!(result, Err(BulkError::Io(_))));
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn remote_filename_cannot_escape_image_dir() {
        let (mut tx, rx) = tokio::io::duplex(1 << 16);
        let record = BulkRecord {
            sender: "mallory".into(),
            filename: "../../etc/passwd".into(),
            payload: vec![0u8; 8],
        };
        let frame = encode_bulk_frame(&record).unwrap();
        tokio::spawn(async move {
            tx.write_all(&frame).await.unwrap();
        });

        let dir = temp_image_dir();
        let (_, path) = receive_transfer(rx, &dir).await.unwrap();
        assert_eq!(path, dir.join("passwd"));
        assert!(path.starts_with(&dir));
        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
