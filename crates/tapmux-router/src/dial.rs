//! Packets held back while a dial is in flight.
//!
//! One bounded FIFO per target node id. The presence of a queue means a dial
//! for that node id has been started and not yet resolved, so a second dial
//! is never started for the same target.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tapmux_core::NodeId;

/// Packets kept per pending dial. The oldest is dropped when full.
pub const DIAL_BUFFER_LEN: usize = 32;

#[derive(Default)]
pub(crate) struct DialBuffer {
    pending: HashMap<NodeId, VecDeque<Bytes>>,
}

impl DialBuffer {
    /// Queue `packet` for `node_id`. Returns true when no dial was in flight
    /// for it yet, meaning the caller must start one.
    pub(crate) fn push(&mut self, node_id: NodeId, packet: Bytes) -> bool {
        let start_dial = !self.pending.contains_key(&node_id);
        let queue = self.pending.entry(node_id).or_default();
        if queue.len() == DIAL_BUFFER_LEN {
            queue.pop_front();
        }
        queue.push_back(packet);
        start_dial
    }

    /// Remove and return everything held for `node_id`, oldest first.
    pub(crate) fn take(&mut self, node_id: &NodeId) -> VecDeque<Bytes> {
        self.pending.remove(node_id).unwrap_or_default()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&NodeId, usize)> {
        self.pending.iter().map(|(id, q)| (id, q.len()))
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }
}
