//! Contract with the mesh core.
//!
//! The core hands out authenticated, encrypted point-to-point connections
//! keyed by the remote public key. The router only needs to accept them,
//! dial them by (partial) node id, push packets into them, and be told when
//! packets come out.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use std::sync::Arc;

use crate::address::{NodeId, PublicKey};
use crate::crypto::Keypair;

/// Invoked by the core for every packet that arrives on a connection.
pub type ReceiveCallback = Box<dyn Fn(Bytes) + Send + Sync>;

/// Invoked by the core once a write has been accepted or has failed.
pub type WriteCompletion = Box<dyn FnOnce(Result<(), ConnError>) + Send>;

/// One secure connection to one remote identity.
pub trait Connection: Send + Sync {
    fn remote_key(&self) -> PublicKey;

    /// Queue `packet` for the remote side. Must not block; the outcome is
    /// reported through `on_complete`.
    fn write(&self, packet: Bytes, on_complete: WriteCompletion);

    /// Replace the receive callback. Packets that arrived before a callback
    /// was registered are delivered to it in order.
    fn set_receive_callback(&self, callback: ReceiveCallback);

    fn close(&self);

    /// Human-readable label for log lines.
    fn describe(&self) -> String {
        format!("conn({})", hex::encode(&self.remote_key()[..8]))
    }
}

/// Source of inbound connections.
#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> Result<Box<dyn Connection>, MeshError>;
}

/// Opens connections to whichever node matches `node_id` under `mask`.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial_by_node_id(
        &self,
        node_id: &NodeId,
        mask: &NodeId,
    ) -> Result<Box<dyn Connection>, MeshError>;
}

/// Connection sources handed out by a started core.
pub type MeshHandles = (Arc<dyn Listener>, Arc<dyn Dialer>);

/// A running mesh core for one identity.
pub trait MeshCore: Send + Sync {
    /// Bring the core up under `keypair` and hand back its connection sources.
    fn start(&self, keypair: &Keypair) -> Result<MeshHandles, MeshError>;
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Write completion failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnError {
    #[error("connection closed")]
    Closed,

    #[error("packet too big (maximum {max_size} bytes)")]
    PacketTooBig { max_size: usize },

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("listener closed")]
    ListenerClosed,

    #[error("no node matching {0}")]
    Unreachable(String),

    #[error("dial failed: {0}")]
    DialFailed(String),

    #[error("node {0} already joined")]
    AlreadyJoined(String),
}
