//! Autoreply: answer inbound messages automatically while marked inactive.

use std::net::SocketAddr;

use crate::protocol::{Envelope, Peer};

/// Stateless decision layer. The dispatcher resolves the sender via the
/// directory first and hands in whatever it found.
#[derive(Debug, Clone)]
pub struct AutoreplyPolicy {
    pub inactive: bool,
    pub reply_text: String,
}

impl AutoreplyPolicy {
    pub fn new(inactive: bool, reply_text: impl Into<String>) -> Self {
        Self {
            inactive,
            reply_text: reply_text.into(),
        }
    }

    /// Decide whether to reply to an inbound message from `sender`.
    /// Replies go unicast to the resolved endpoint; if the directory does
    /// not know the sender yet, fall back to the address the datagram
    /// actually arrived from. Never replies to self or while active.
    pub fn decide(
        &self,
        self_handle: &str,
        sender: &str,
        resolved: Option<&Peer>,
        observed_from: SocketAddr,
    ) -> Option<(SocketAddr, Envelope)> {
        if !self.inactive || sender == self_handle {
            return None;
        }
        let dest = resolved.map(Peer::addr).unwrap_or(observed_from);
        let reply = Envelope::Message {
            sender: self_handle.to_string(),
            target: sender.to_string(),
            text: self.reply_text.clone(),
        };
        Some((dest, reply))
    }
}
