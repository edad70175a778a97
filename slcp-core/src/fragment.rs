//! Fragmentation: split oversized serialized envelopes into bounded chunks,
//! reassemble from fragments arriving in any order. Stale partial buffers
//! are evicted after an inactivity window so loss never leaks memory.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::protocol::{Envelope, DATAGRAM_BOUND};

/// Default inactivity window before a partial fragment set is evicted.
pub const DEFAULT_REASSEMBLY_WINDOW: Duration = Duration::from_secs(30);

/// Split `payload` into `ceil(len / bound)` chunk envelopes sharing a fresh
/// message id. Each chunk is independently addressed; transport order is not
/// guaranteed. A payload that fits within the bound is the caller's unframed
/// fast path, but a single-chunk result is still valid.
pub fn fragment(payload: &[u8], bound: usize) -> Vec<Envelope> {
    let bound = if bound == 0 { DATAGRAM_BOUND } else { bound };
    let message_id = Uuid::new_v4();
    let total = payload.len().div_ceil(bound) as u32;
    payload
        .chunks(bound)
        .enumerate()
        .map(|(index, part)| Envelope::Chunk {
            message_id,
            index: index as u32,
            total,
            payload: part.to_vec(),
        })
        .collect()
}

/// Outcome of feeding one chunk to the reassembler.
#[derive(Debug, PartialEq, Eq)]
pub enum Accept {
    /// All indices 0..total-1 present; the reassembled payload.
    Complete(Vec<u8>),
    /// Stored; more chunks outstanding.
    Incomplete,
    /// Same (message_id, index) seen before; ignored.
    Duplicate,
}

#[derive(Debug, thiserror::Error)]
pub enum ReassemblyError {
    #[error("chunk declares zero total")]
    ZeroTotal,
    #[error("chunk index {index} out of range for total {total}")]
    IndexOutOfRange { index: u32, total: u32 },
    #[error("chunk total {got} disagrees with buffer total {expected}")]
    MismatchedTotal { got: u32, expected: u32 },
}

struct Buffer {
    total: u32,
    parts: HashMap<u32, Vec<u8>>,
    last_activity: Instant,
}

/// Reassembly buffers keyed by message id. Owned by exactly one task.
pub struct Reassembler {
    buffers: HashMap<Uuid, Buffer>,
    window: Duration,
}

impl Reassembler {
    pub fn new(window: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            window,
        }
    }

    /// Insert one chunk. Returns the reassembled payload once all indices
    /// are present; the completed buffer is dropped. Duplicates are ignored
    /// and never double-count toward completion.
    pub fn accept(
        &mut self,
        message_id: Uuid,
        index: u32,
        total: u32,
        payload: Vec<u8>,
        now: Instant,
    ) -> Result<Accept, ReassemblyError> {
        if total == 0 {
            return Err(ReassemblyError::ZeroTotal);
        }
        if index >= total {
            return Err(ReassemblyError::IndexOutOfRange { index, total });
        }
        let buffer = self.buffers.entry(message_id).or_insert_with(|| Buffer {
            total,
            parts: HashMap::new(),
            last_activity: now,
        });
        if buffer.total != total {
            return Err(ReassemblyError::MismatchedTotal {
                got: total,
                expected: buffer.total,
            });
        }
        if buffer.parts.contains_key(&index) {
            buffer.last_activity = now;
            return Ok(Accept::Duplicate);
        }
        buffer.parts.insert(index, payload);
        buffer.last_activity = now;

        if buffer.parts.len() as u32 == buffer.total {
            if let Some(buffer) = self.buffers.remove(&message_id) {
                let mut out = Vec::new();
                for i in 0..buffer.total {
                    if let Some(part) = buffer.parts.get(&i) {
                        out.extend_from_slice(part);
                    }
                }
                return Ok(Accept::Complete(out));
            }
        }
        Ok(Accept::Incomplete)
    }

    /// Evict buffers idle longer than the inactivity window; returns their
    /// message ids so the caller can report a reassembly failure.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<Uuid> {
        let window = self.window;
        let expired: Vec<Uuid> = self
            .buffers
            .iter()
            .filter(|(_, b)| now.duration_since(b.last_activity) >= window)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.buffers.remove(id);
        }
        expired
    }

    /// Number of in-progress buffers.
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_REASSEMBLY_WINDOW)
    }
}
