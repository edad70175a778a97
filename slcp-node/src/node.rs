//! Collaborator interface for front ends (CLI/GUI): send envelopes, resolve
//! handles, and initiate image transfers. Front ends consume the
//! notification stream handed out in `main`.

use std::path::Path;

use slcp_core::{Envelope, Peer};
use tokio::sync::mpsc;

use crate::bulk::{self, BulkError};
use crate::directory::DirectoryHandle;
use crate::dispatcher::Outbound;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
    #[error("node is shutting down")]
    Closed,
    #[error(transparent)]
    Transfer(#[from] BulkError),
}

/// Cheap-to-clone façade over the directory and the dispatcher's outbound
/// channel.
#[derive(Clone)]
pub struct NodeHandle {
    handle: String,
    port: u16,
    directory: DirectoryHandle,
    outbound: mpsc::Sender<Outbound>,
}

impl NodeHandle {
    pub fn new(
        handle: String,
        port: u16,
        directory: DirectoryHandle,
        outbound: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            handle,
            port,
            directory,
            outbound,
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Resolve a handle to an endpoint. A miss is an ordinary result.
    pub async fn lookup(&self, handle: &str) -> Option<Peer> {
        self.directory.lookup(handle).await.ok().flatten()
    }

    /// Unicast a text message to a known peer.
    pub async fn send_message(&self, target: &str, text: &str) -> Result<(), SendError> {
        let peer = self
            .lookup(target)
            .await
            .ok_or_else(|| SendError::UnknownPeer(target.to_string()))?;
        let env = Envelope::Message {
            sender: self.handle.clone(),
            target: target.to_string(),
            text: text.to_string(),
        };
        self.outbound
            .send(Outbound::Unicast(env, peer.addr()))
            .await
            .map_err(|_| SendError::Closed)
    }

    /// Announce and transfer an image: a small header on the data channel,
    /// then the payload over the bulk side-channel.
    pub async fn send_image(&self, target: &str, path: &Path) -> Result<(), SendError> {
        let peer = self
            .lookup(target)
            .await
            .ok_or_else(|| SendError::UnknownPeer(target.to_string()))?;
        let size = bulk::send_image(&peer, &self.handle, path).await?;
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("image.bin")
            .replace(char::is_whitespace, "_");
        let header = Envelope::ImageHeader {
            sender: self.handle.clone(),
            name,
            size,
        };
        self.outbound
            .send(Outbound::Unicast(header, peer.addr()))
            .await
            .map_err(|_| SendError::Closed)
    }

    /// Broadcast our presence on the discovery channel.
    pub async fn announce_join(&self) -> Result<(), SendError> {
        let env = Envelope::Join {
            handle: self.handle.clone(),
            port: self.port,
        };
        self.outbound
            .send(Outbound::Broadcast(env))
            .await
            .map_err(|_| SendError::Closed)
    }

    /// Ask the network who is out there; answers arrive as KNOWNUSERS.
    pub async fn request_who(&self) -> Result<(), SendError> {
        self.outbound
            .send(Outbound::Broadcast(Envelope::Who))
            .await
            .map_err(|_| SendError::Closed)
    }

    /// Broadcast a graceful leave.
    pub async fn leave(&self) -> Result<(), SendError> {
        let env = Envelope::Leave {
            handle: self.handle.clone(),
        };
        self.outbound
            .send(Outbound::Broadcast(env))
            .await
            .map_err(|_| SendError::Closed)
    }
}
