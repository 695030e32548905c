//! In-memory mesh: every joined node can dial every other.
//!
//! Stands in for the real mesh core in tests and in the demo daemon.
//! Delivery is synchronous and loss-free. Dials can be held open to observe
//! what the router does while a connection is still being set up.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};

use super::{
    ConnError, Connection, Dialer, Listener, MeshCore, MeshError, MeshHandles, ReceiveCallback,
    WriteCompletion,
};
use crate::address::{NodeId, PublicKey};
use crate::crypto::Keypair;
use crate::packet::MAX_PACKET_LEN;

struct Member {
    node_id: NodeId,
    incoming: mpsc::UnboundedSender<Box<dyn Connection>>,
}

struct MeshInner {
    members: DashMap<PublicKey, Member>,
    mtu: AtomicUsize,
    dials: AtomicUsize,
    closes: AtomicUsize,
    /// true while dials may complete
    gate: watch::Sender<bool>,
}

/// Shared handle to one in-memory mesh.
#[derive(Clone)]
pub struct MemoryMesh {
    inner: Arc<MeshInner>,
}

impl MemoryMesh {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            inner: Arc::new(MeshInner {
                members: DashMap::new(),
                mtu: AtomicUsize::new(MAX_PACKET_LEN),
                dials: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                gate,
            }),
        }
    }

    /// Add a node. Connections dialed to it arrive on the returned listener.
    pub fn join(&self, key: PublicKey) -> (MemoryListener, MemoryDialer) {
        let (incoming, rx) = mpsc::unbounded_channel();
        self.inner.members.insert(
            key,
            Member {
                node_id: NodeId::for_key(&key),
                incoming,
            },
        );
        (
            MemoryListener {
                incoming: tokio::sync::Mutex::new(rx),
            },
            MemoryDialer {
                mesh: self.inner.clone(),
                key,
            },
        )
    }

    /// Remove a node. Later dials to it fail and its listener ends.
    pub fn leave(&self, key: &PublicKey) {
        self.inner.members.remove(key);
    }

    /// Largest packet a connection accepts before reporting PacketTooBig.
    pub fn set_mtu(&self, mtu: usize) {
        self.inner.mtu.store(mtu, Ordering::SeqCst);
    }

    /// Number of dials started since the mesh was created.
    pub fn dials_started(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    /// Number of `close` calls seen across all connections.
    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    /// Park every dial until `release_dials`.
    pub fn hold_dials(&self) {
        self.inner.gate.send_replace(false);
    }

    pub fn release_dials(&self) {
        self.inner.gate.send_replace(true);
    }

    /// Open a connection from `from` to `to` without going through a dialer.
    /// `to` receives its half on its listener; the caller keeps `from`'s half.
    pub fn connect(&self, from: PublicKey, to: &PublicKey) -> Result<MemoryConnection, MeshError> {
        let incoming = self
            .inner
            .members
            .get(to)
            .map(|m| m.incoming.clone())
            .ok_or_else(|| MeshError::Unreachable(hex::encode(&to[..8])))?;
        let (ours, theirs) = self.inner.pair(from, *to);
        incoming
            .send(Box::new(theirs))
            .map_err(|_| MeshError::DialFailed("listener gone".into()))?;
        Ok(ours)
    }
}

impl MeshCore for MemoryMesh {
    fn start(&self, keypair: &Keypair) -> Result<MeshHandles, MeshError> {
        if self.inner.members.contains_key(&keypair.public) {
            return Err(MeshError::AlreadyJoined(hex::encode(&keypair.public[..8])));
        }
        let (listener, dialer) = self.join(keypair.public);
        Ok((Arc::new(listener), Arc::new(dialer)))
    }
}

impl Default for MemoryMesh {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshInner {
    /// Two halves of one connection: the first is held by `a`, the second
    /// by `b`.
    fn pair(self: &Arc<Self>, a: PublicKey, b: PublicKey) -> (MemoryConnection, MemoryConnection) {
        let a_inbox = Arc::new(Inbox::default());
        let b_inbox = Arc::new(Inbox::default());
        let closed = Arc::new(AtomicBool::new(false));
        let a_half = MemoryConnection {
            remote_key: b,
            inbox: a_inbox.clone(),
            peer_inbox: b_inbox.clone(),
            closed: closed.clone(),
            mesh: self.clone(),
        };
        let b_half = MemoryConnection {
            remote_key: a,
            inbox: b_inbox,
            peer_inbox: a_inbox,
            closed,
            mesh: self.clone(),
        };
        (a_half, b_half)
    }
}

// ── Listener / Dialer ─────────────────────────────────────────────────────────

pub struct MemoryListener {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Box<dyn Connection>>>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> Result<Box<dyn Connection>, MeshError> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(MeshError::ListenerClosed)
    }
}

pub struct MemoryDialer {
    mesh: Arc<MeshInner>,
    key: PublicKey,
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial_by_node_id(
        &self,
        node_id: &NodeId,
        mask: &NodeId,
    ) -> Result<Box<dyn Connection>, MeshError> {
        self.mesh.dials.fetch_add(1, Ordering::SeqCst);

        let mut gate = self.mesh.gate.subscribe();
        while !*gate.borrow_and_update() {
            if gate.changed().await.is_err() {
                return Err(MeshError::DialFailed("mesh dropped".into()));
            }
        }

        let target = self
            .mesh
            .members
            .iter()
            .find(|m| *m.key() != self.key && m.value().node_id.matches(node_id, mask))
            .map(|m| (*m.key(), m.value().incoming.clone()));

        let (remote, incoming) = match target {
            Some(t) => t,
            None => {
                tracing::debug!(node = %node_id.short(), "no mesh member matches dial");
                return Err(MeshError::Unreachable(node_id.short()));
            }
        };

        let (ours, theirs) = self.mesh.pair(self.key, remote);
        incoming
            .send(Box::new(theirs))
            .map_err(|_| MeshError::DialFailed("listener gone".into()))?;
        Ok(Box::new(ours))
    }
}

// ── Connection ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Inbox {
    callback: Mutex<Option<ReceiveCallback>>,
    backlog: Mutex<VecDeque<Bytes>>,
}

impl Inbox {
    fn deliver(&self, packet: Bytes) {
        let callback = self.callback.lock().unwrap_or_else(|e| e.into_inner());
        match callback.as_ref() {
            Some(cb) => cb(packet),
            None => self
                .backlog
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_back(packet),
        }
    }

    fn install(&self, cb: ReceiveCallback) {
        let mut callback = self.callback.lock().unwrap_or_else(|e| e.into_inner());
        let mut backlog = self.backlog.lock().unwrap_or_else(|e| e.into_inner());
        for packet in backlog.drain(..) {
            cb(packet);
        }
        *callback = Some(cb);
    }
}

/// One half of an in-memory connection.
pub struct MemoryConnection {
    remote_key: PublicKey,
    inbox: Arc<Inbox>,
    peer_inbox: Arc<Inbox>,
    closed: Arc<AtomicBool>,
    mesh: Arc<MeshInner>,
}

impl MemoryConnection {
    /// Synchronous write for harness code.
    pub fn send(&self, packet: impl Into<Bytes>) -> Result<(), ConnError> {
        let packet = packet.into();
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnError::Closed);
        }
        let max_size = self.mesh.mtu.load(Ordering::SeqCst);
        if packet.len() > max_size {
            return Err(ConnError::PacketTooBig { max_size });
        }
        self.peer_inbox.deliver(packet);
        Ok(())
    }

    /// Route everything arriving on this half into a channel.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.set_receive_callback(Box::new(move |packet| {
            let _ = tx.send(packet);
        }));
        rx
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Connection for MemoryConnection {
    fn remote_key(&self) -> PublicKey {
        self.remote_key
    }

    fn write(&self, packet: Bytes, on_complete: WriteCompletion) {
        on_complete(self.send(packet));
    }

    fn set_receive_callback(&self, callback: ReceiveCallback) {
        self.inbox.install(callback);
    }

    fn close(&self) {
        self.mesh.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}
