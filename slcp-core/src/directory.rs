//! In-memory peer directory: handle -> endpoint, with liveness tracking.
//!
//! Exactly one owner mutates this (the directory service task in the daemon);
//! everyone else goes through its request/response interface.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::protocol::Peer;

struct Entry {
    ip: IpAddr,
    port: u16,
    last_seen: Instant,
}

/// Registry of known peers. A handle maps to at most one endpoint.
pub struct Directory {
    entries: HashMap<String, Entry>,
}

impl Directory {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Insert or overwrite the peer for `handle`. Returns true iff the handle
    /// was not known before (drives "peer joined" notifications). A direct
    /// JOIN always wins, so an existing entry's endpoint is overwritten;
    /// re-registering an identical endpoint only refreshes liveness.
    pub fn register(&mut self, handle: &str, ip: IpAddr, port: u16, now: Instant) -> bool {
        match self.entries.get_mut(handle) {
            Some(entry) => {
                entry.ip = ip;
                entry.port = port;
                entry.last_seen = now;
                false
            }
            None => {
                self.entries.insert(
                    handle.to_string(),
                    Entry {
                        ip,
                        port,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    /// Delete the entry if present. Returns whether an entry was removed.
    pub fn unregister(&mut self, handle: &str) -> bool {
        self.entries.remove(handle).is_some()
    }

    /// Point query.
    pub fn lookup(&self, handle: &str) -> Option<Peer> {
        self.entries.get(handle).map(|e| Peer {
            handle: handle.to_string(),
            ip: e.ip,
            port: e.port,
        })
    }

    /// Consistent copy of all entries, sorted by handle (used to answer WHO).
    pub fn snapshot(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .entries
            .iter()
            .map(|(handle, e)| Peer {
                handle: handle.clone(),
                ip: e.ip,
                port: e.port,
            })
            .collect();
        peers.sort_by(|a, b| a.handle.cmp(&b.handle));
        peers
    }

    /// Merge secondhand entries (KNOWNUSERS report): only add absent handles,
    /// never overwrite a known endpoint from a relay. Returns the entries
    /// actually added. First-seen wins for secondhand data; a direct JOIN
    /// (register) is the only thing that overwrites.
    pub fn merge(&mut self, entries: &[Peer], now: Instant) -> Vec<Peer> {
        let mut added = Vec::new();
        for peer in entries {
            if self.entries.contains_key(&peer.handle) {
                continue;
            }
            self.entries.insert(
                peer.handle.clone(),
                Entry {
                    ip: peer.ip,
                    port: peer.port,
                    last_seen: now,
                },
            );
            added.push(peer.clone());
        }
        added
    }

    /// Remove peers not directly heard from within `timeout`; returns them.
    /// Covers peers that crash without an explicit LEAVE.
    pub fn sweep_expired(&mut self, now: Instant, timeout: Duration) -> Vec<Peer> {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_seen) >= timeout)
            .map(|(h, _)| h.clone())
            .collect();
        let mut removed = Vec::new();
        for handle in stale {
            if let Some(e) = self.entries.remove(&handle) {
                removed.push(Peer {
                    handle,
                    ip: e.ip,
                    port: e.port,
                });
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}
