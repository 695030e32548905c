//! Adapter: routes application packets to per-peer sessions.
//!
//! One actor owns both session tables and the dial buffer, so lookups,
//! installs and removals never race. Everything else talks to it through
//! `AdapterMsg`: the reader posts packets, the accept loop posts inbound
//! connections, dial tasks post their outcome and sessions post close
//! requests. The mailbox is unbounded; the reader feeds it one conduit
//! packet at a time, so application traffic is paced by the conduit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use tapmux_core::config::{ConfigError, TapmuxConfig};
use tapmux_core::packet::{self, Destination};
use tapmux_core::{
    Address, Connection, Dialer, Listener, MeshError, NodeAddrs, NodeId, PublicKey, Subnet,
};

use crate::conduit::{Conduit, ConduitCloser};
use crate::dial::DialBuffer;
use crate::io::{Reader, Writer, WriterHandle};
use crate::session::{Session, SessionHandle, SessionId, SessionParams, SESSION_IDLE_TIMEOUT};

pub(crate) enum AdapterMsg {
    /// Packet read from the conduit.
    Packet(Bytes),
    /// Inbound connection from the listener.
    Accepted(Box<dyn Connection>),
    DialDone {
        node_id: NodeId,
        result: Result<Box<dyn Connection>, MeshError>,
    },
    CloseSession {
        id: SessionId,
        peer: NodeAddrs,
    },
    UpdateConfig(TapmuxConfig),
    Snapshot(oneshot::Sender<AdapterSnapshot>),
    Stop(oneshot::Sender<()>),
}

/// Name and MTU as currently configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub mtu: u16,
}

impl InterfaceInfo {
    fn from_config(config: &TapmuxConfig) -> Self {
        Self {
            name: config.interface.name.clone(),
            mtu: config.supported_mtu(),
        }
    }
}

/// Point-in-time copy of the adapter's tables.
#[derive(Debug, Clone, Default)]
pub struct AdapterSnapshot {
    pub by_address: Vec<(Address, SessionId)>,
    pub by_subnet: Vec<(Subnet, SessionId)>,
    /// Node ids with a dial in flight and how many packets wait on each.
    pub pending_dials: Vec<(NodeId, usize)>,
}

impl AdapterSnapshot {
    pub fn session_for_address(&self, address: &Address) -> Option<SessionId> {
        self.by_address
            .iter()
            .find(|(a, _)| a == address)
            .map(|(_, id)| *id)
    }

    pub fn session_for_subnet(&self, subnet: &Subnet) -> Option<SessionId> {
        self.by_subnet
            .iter()
            .find(|(s, _)| s == subnet)
            .map(|(_, id)| *id)
    }

    /// Distinct sessions across both tables.
    pub fn session_count(&self) -> usize {
        let mut ids: Vec<SessionId> = self
            .by_address
            .iter()
            .map(|(_, id)| *id)
            .chain(self.by_subnet.iter().map(|(_, id)| *id))
            .collect();
        ids.sort();
        ids.dedup();
        ids.len()
    }

    pub fn pending_for(&self, node_id: &NodeId) -> Option<usize> {
        self.pending_dials
            .iter()
            .find(|(id, _)| id == node_id)
            .map(|(_, n)| *n)
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

/// Collects everything the adapter needs before it can start.
pub struct AdapterBuilder {
    config: Option<TapmuxConfig>,
    listener: Option<Arc<dyn Listener>>,
    dialer: Option<Arc<dyn Dialer>>,
    conduit: Option<Conduit>,
    idle_timeout: Duration,
}

impl AdapterBuilder {
    pub fn config(mut self, config: TapmuxConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn Listener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn conduit(mut self, conduit: Conduit) -> Self {
        self.conduit = Some(conduit);
        self
    }

    /// Override the session inactivity timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Validate the inputs and spawn the adapter, reader, writer and accept
    /// loop. Must be called from within a tokio runtime.
    pub fn start(self) -> Result<Adapter, AdapterError> {
        let config = self.config.ok_or(AdapterError::MissingConfig)?;
        let listener = self.listener.ok_or(AdapterError::MissingListener)?;
        let dialer = self.dialer.ok_or(AdapterError::MissingDialer)?;
        let conduit = self.conduit.ok_or(AdapterError::MissingConduit)?;
        let public_key = config.public_key()?;
        let local = NodeAddrs::for_key(&public_key);

        let (tx, inbox) = mpsc::unbounded_channel();
        let (reader, writer, closer) = conduit.into_parts();
        let (writer, writer_handle) = Writer::new(writer);
        tokio::spawn(writer.run());
        tokio::spawn(Reader::new(reader, tx.clone()).run());
        let accept_task = tokio::spawn(accept_loop(listener, tx.clone()));

        let interface = InterfaceInfo::from_config(&config);
        tracing::info!(
            address = %local.address,
            subnet = %local.subnet,
            name = %interface.name,
            mtu = interface.mtu,
            "adapter started"
        );
        let (info_tx, info) = watch::channel(interface);

        let actor = AdapterActor {
            local,
            public_key,
            info: info_tx,
            tx: tx.clone(),
            inbox,
            dialer,
            writer: writer_handle,
            closer,
            accept_task,
            by_address: HashMap::new(),
            by_subnet: HashMap::new(),
            dials: DialBuffer::default(),
            next_session: 0,
            idle_timeout: self.idle_timeout,
        };
        tokio::spawn(actor.run());

        Ok(Adapter {
            tx,
            info,
            local,
            public_key,
        })
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Handle to a running adapter. Cheap to clone.
#[derive(Clone)]
pub struct Adapter {
    tx: mpsc::UnboundedSender<AdapterMsg>,
    info: watch::Receiver<InterfaceInfo>,
    local: NodeAddrs,
    public_key: PublicKey,
}

impl Adapter {
    pub fn builder() -> AdapterBuilder {
        AdapterBuilder {
            config: None,
            listener: None,
            dialer: None,
            conduit: None,
            idle_timeout: SESSION_IDLE_TIMEOUT,
        }
    }

    pub fn name(&self) -> String {
        self.info.borrow().name.clone()
    }

    pub fn mtu(&self) -> u16 {
        self.info.borrow().mtu
    }

    /// Packets are layer 3; there is no ethernet framing.
    pub fn is_tap(&self) -> bool {
        false
    }

    pub fn address(&self) -> Address {
        self.local.address
    }

    pub fn subnet(&self) -> Subnet {
        self.local.subnet
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn update_config(&self, config: TapmuxConfig) -> Result<(), AdapterError> {
        self.tx
            .send(AdapterMsg::UpdateConfig(config))
            .map_err(|_| AdapterError::Stopped)
    }

    pub async fn snapshot(&self) -> Result<AdapterSnapshot, AdapterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AdapterMsg::Snapshot(reply))
            .map_err(|_| AdapterError::Stopped)?;
        rx.await.map_err(|_| AdapterError::Stopped)
    }

    /// Close the conduit and every session. Stopping twice is a no-op.
    pub async fn stop(&self) -> Result<(), AdapterError> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(AdapterMsg::Stop(reply)).is_err() {
            return Ok(());
        }
        // A dropped reply means another stop won the race.
        let _ = rx.await;
        Ok(())
    }
}

// ── Actor ─────────────────────────────────────────────────────────────────────

struct AdapterActor {
    local: NodeAddrs,
    public_key: PublicKey,
    info: watch::Sender<InterfaceInfo>,
    tx: mpsc::UnboundedSender<AdapterMsg>,
    inbox: mpsc::UnboundedReceiver<AdapterMsg>,
    dialer: Arc<dyn Dialer>,
    writer: WriterHandle,
    closer: ConduitCloser,
    accept_task: JoinHandle<()>,
    by_address: HashMap<Address, SessionHandle>,
    by_subnet: HashMap<Subnet, SessionHandle>,
    dials: DialBuffer,
    next_session: u64,
    idle_timeout: Duration,
}

impl AdapterActor {
    async fn run(mut self) {
        while let Some(msg) = self.inbox.recv().await {
            match msg {
                AdapterMsg::Packet(packet) => self.handle_packet(packet),
                AdapterMsg::Accepted(conn) => {
                    self.wrap(conn);
                }
                AdapterMsg::DialDone { node_id, result } => self.dial_done(node_id, result),
                AdapterMsg::CloseSession { id, peer } => self.close_session(id, &peer),
                AdapterMsg::UpdateConfig(config) => self.update_config(config),
                AdapterMsg::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                AdapterMsg::Stop(reply) => {
                    self.stop();
                    let _ = reply.send(());
                    return;
                }
            }
        }
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    fn handle_packet(&mut self, packet: Bytes) {
        let dst = match packet::classify(&packet) {
            Ok(d) => d,
            Err(e) => {
                tracing::trace!(error = %e, len = packet.len(), "dropping packet from conduit");
                return;
            }
        };

        if let Some(session) = self.lookup(&dst) {
            if session.write(packet).is_err() {
                tracing::trace!(id = %session.id(), "session gone, dropping packet");
            }
            return;
        }

        let (node_id, mask) = if dst.address.is_valid() {
            dst.address.node_id_and_mask()
        } else {
            dst.subnet.node_id_and_mask()
        };
        if self.dials.push(node_id, packet) {
            self.start_dial(node_id, mask);
        }
    }

    fn lookup(&self, dst: &Destination) -> Option<&SessionHandle> {
        self.by_address
            .get(&dst.address)
            .or_else(|| self.by_subnet.get(&dst.subnet))
    }

    fn start_dial(&self, node_id: NodeId, mask: NodeId) {
        tracing::debug!(node = %node_id.short(), "dialing");
        let dialer = self.dialer.clone();
        let adapter = self.tx.clone();
        tokio::spawn(async move {
            let result = dialer.dial_by_node_id(&node_id, &mask).await;
            let msg = AdapterMsg::DialDone { node_id, result };
            if let Err(mpsc::error::SendError(AdapterMsg::DialDone { result: Ok(conn), .. })) =
                adapter.send(msg)
            {
                conn.close();
            }
        });
    }

    fn dial_done(&mut self, node_id: NodeId, result: Result<Box<dyn Connection>, MeshError>) {
        let held = self.dials.take(&node_id);
        let conn = match result {
            Ok(conn) => conn,
            Err(e) => {
                tracing::debug!(
                    node = %node_id.short(),
                    error = %e,
                    dropped = held.len(),
                    "dial failed"
                );
                return;
            }
        };
        let session = self.wrap(conn);
        // Flushed in arrival order, even if the new session replaced an old one.
        for packet in held {
            if session.write(packet).is_err() {
                break;
            }
        }
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    /// Install a session for `conn`, closing whatever held its address or
    /// subnet before.
    fn wrap(&mut self, conn: Box<dyn Connection>) -> SessionHandle {
        let peer = NodeAddrs::for_key(&conn.remote_key());

        let mut replaced: Vec<SessionHandle> = Vec::new();
        for old in [
            self.by_address.get(&peer.address),
            self.by_subnet.get(&peer.subnet),
        ]
        .into_iter()
        .flatten()
        {
            if !replaced.contains(old) {
                replaced.push(old.clone());
            }
        }
        for old in replaced {
            tracing::debug!(
                old = %old.id(),
                peer = %peer.address,
                "session collision, closing old session"
            );
            self.close_session(old.id(), old.peer());
        }

        self.next_session += 1;
        let handle = Session::spawn(SessionParams {
            id: SessionId(self.next_session),
            local: self.local,
            conn,
            adapter: self.tx.clone(),
            writer: self.writer.clone(),
            idle_timeout: self.idle_timeout,
        });
        self.by_address.insert(peer.address, handle.clone());
        self.by_subnet.insert(peer.subnet, handle.clone());
        handle
    }

    /// Remove `id` from whichever tables still point at it and tell it to
    /// close. Entries already taken over by a newer session are left alone.
    fn close_session(&mut self, id: SessionId, peer: &NodeAddrs) {
        let mut removed = None;
        if self.by_address.get(&peer.address).is_some_and(|s| s.id() == id) {
            removed = self.by_address.remove(&peer.address);
        }
        if self.by_subnet.get(&peer.subnet).is_some_and(|s| s.id() == id) {
            removed = self.by_subnet.remove(&peer.subnet).or(removed);
        }
        if let Some(session) = removed {
            session.shutdown();
        }
    }

    // ── Control ───────────────────────────────────────────────────────────────

    fn update_config(&mut self, config: TapmuxConfig) {
        if config.public_key().ok() != Some(self.public_key) {
            tracing::warn!("identity change ignored until restart");
        }
        let interface = InterfaceInfo::from_config(&config);
        tracing::debug!(name = %interface.name, mtu = interface.mtu, "configuration updated");
        self.info.send_replace(interface);
    }

    fn snapshot(&self) -> AdapterSnapshot {
        let mut by_address: Vec<_> = self.by_address.iter().map(|(a, s)| (*a, s.id())).collect();
        let mut by_subnet: Vec<_> = self.by_subnet.iter().map(|(n, s)| (*n, s.id())).collect();
        let mut pending_dials: Vec<_> = self.dials.iter().map(|(id, n)| (*id, n)).collect();
        by_address.sort_by_key(|(_, id)| *id);
        by_subnet.sort_by_key(|(_, id)| *id);
        pending_dials.sort_by_key(|(id, _)| id.0);
        AdapterSnapshot {
            by_address,
            by_subnet,
            pending_dials,
        }
    }

    fn stop(&mut self) {
        self.closer.close();
        self.accept_task.abort();
        self.dials.clear();

        let mut sessions: Vec<SessionHandle> = self.by_address.drain().map(|(_, s)| s).collect();
        for (_, s) in self.by_subnet.drain() {
            if !sessions.contains(&s) {
                sessions.push(s);
            }
        }
        for session in &sessions {
            session.shutdown();
        }

        // Connections that raced with the stop are closed rather than leaked.
        self.inbox.close();
        while let Ok(msg) = self.inbox.try_recv() {
            match msg {
                AdapterMsg::Accepted(conn)
                | AdapterMsg::DialDone {
                    result: Ok(conn), ..
                } => conn.close(),
                AdapterMsg::Stop(reply) => {
                    let _ = reply.send(());
                }
                _ => {}
            }
        }

        tracing::info!(
            address = %self.local.address,
            sessions = sessions.len(),
            "adapter stopped"
        );
    }
}

async fn accept_loop(listener: Arc<dyn Listener>, adapter: mpsc::UnboundedSender<AdapterMsg>) {
    loop {
        match listener.accept().await {
            Ok(conn) => {
                tracing::trace!(conn = %conn.describe(), "accepted connection");
                if let Err(mpsc::error::SendError(AdapterMsg::Accepted(conn))) =
                    adapter.send(AdapterMsg::Accepted(conn))
                {
                    conn.close();
                    return;
                }
            }
            Err(MeshError::ListenerClosed) => {
                tracing::debug!("listener closed, accept loop exiting");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "connection accept error");
                return;
            }
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no configuration supplied")]
    MissingConfig,

    #[error("no listener supplied")]
    MissingListener,

    #[error("no dialer supplied")]
    MissingDialer,

    #[error("no conduit supplied")]
    MissingConduit,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("adapter stopped")]
    Stopped,
}
