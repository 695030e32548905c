//! Session: one actor per remote peer.
//!
//! A session owns exactly one mesh connection. It checks that every packet
//! crossing it is addressed between this node and that peer, and asks the
//! adapter to close it after two minutes without a successful read or write.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use tapmux_core::packet::is_cga;
use tapmux_core::{ConnError, Connection, NodeAddrs};

use crate::adapter::AdapterMsg;
use crate::io::WriterHandle;

/// Inactivity allowed before a session asks to be closed.
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

pub(crate) enum SessionMsg {
    /// Packet arrived from the peer.
    Read(Bytes),
    /// Packet from the application for the peer.
    Write(Bytes),
    /// The connection reported a failed write.
    WriteFailed(ConnError),
    /// Issued by the adapter once the session is out of its tables.
    Close,
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Mailbox handle for a running session. Cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    peer: NodeAddrs,
    inbox: mpsc::UnboundedSender<SessionMsg>,
    adapter: mpsc::UnboundedSender<AdapterMsg>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The peer's address and subnet.
    pub fn peer(&self) -> &NodeAddrs {
        &self.peer
    }

    /// Queue an application packet for the peer.
    pub fn write(&self, packet: Bytes) -> Result<(), SessionError> {
        self.inbox
            .send(SessionMsg::Write(packet))
            .map_err(|_| SessionError::Closed)
    }

    /// Ask the adapter to remove and close this session.
    pub fn close(&self) {
        let _ = self.adapter.send(AdapterMsg::CloseSession {
            id: self.id,
            peer: self.peer,
        });
    }

    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.inbox.send(SessionMsg::Close);
    }
}

impl PartialEq for SessionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SessionHandle {}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer.address)
            .finish()
    }
}

// ── Actor ─────────────────────────────────────────────────────────────────────

pub(crate) struct SessionParams {
    pub id: SessionId,
    pub local: NodeAddrs,
    pub conn: Box<dyn Connection>,
    pub adapter: mpsc::UnboundedSender<AdapterMsg>,
    pub writer: WriterHandle,
    pub idle_timeout: Duration,
}

pub(crate) struct Session {
    id: SessionId,
    peer: NodeAddrs,
    local: NodeAddrs,
    conn: Box<dyn Connection>,
    inbox: mpsc::UnboundedReceiver<SessionMsg>,
    /// Handed to write completions.
    own_tx: mpsc::UnboundedSender<SessionMsg>,
    adapter: mpsc::UnboundedSender<AdapterMsg>,
    writer: WriterHandle,
    idle_timeout: Duration,
    close_requested: bool,
}

impl Session {
    /// Register the connection's receive callback and start the actor.
    pub(crate) fn spawn(params: SessionParams) -> SessionHandle {
        let SessionParams {
            id,
            local,
            conn,
            adapter,
            writer,
            idle_timeout,
        } = params;

        let peer = NodeAddrs::for_key(&conn.remote_key());
        let (own_tx, inbox) = mpsc::unbounded_channel();

        let rx_tx = own_tx.clone();
        conn.set_receive_callback(Box::new(move |packet| {
            if rx_tx.send(SessionMsg::Read(packet)).is_err() {
                tracing::trace!("session gone, dropping inbound packet");
            }
        }));

        let handle = SessionHandle {
            id,
            peer,
            inbox: own_tx.clone(),
            adapter: adapter.clone(),
        };

        tracing::debug!(%id, peer = %peer.address, conn = %conn.describe(), "session started");

        let session = Session {
            id,
            peer,
            local,
            conn,
            inbox,
            own_tx,
            adapter,
            writer,
            idle_timeout,
            close_requested: false,
        };
        tokio::spawn(session.run());
        handle
    }

    async fn run(mut self) {
        let idle = tokio::time::sleep(self.idle_timeout);
        tokio::pin!(idle);

        loop {
            let armed = !self.close_requested;
            tokio::select! {
                msg = self.inbox.recv() => {
                    let msg = match msg {
                        Some(m) => m,
                        None => break,
                    };
                    match msg {
                        SessionMsg::Read(packet) => match self.handle_read(packet) {
                            Ok(()) => idle.as_mut().reset(Instant::now() + self.idle_timeout),
                            Err(e) => {
                                tracing::debug!(id = %self.id, error = %e, "inbound dropped")
                            }
                        },
                        SessionMsg::Write(packet) => match self.handle_write(packet) {
                            Ok(()) => idle.as_mut().reset(Instant::now() + self.idle_timeout),
                            Err(e) => {
                                tracing::debug!(id = %self.id, error = %e, "outbound dropped")
                            }
                        },
                        SessionMsg::WriteFailed(e) => self.handle_write_failure(e),
                        SessionMsg::Close => break,
                    }
                }

                () = &mut idle, if armed => {
                    tracing::debug!(id = %self.id, peer = %self.peer.address, "session idle");
                    self.request_close();
                }
            }
        }

        self.conn.close();
        tracing::debug!(id = %self.id, peer = %self.peer.address, "session closed");
    }

    fn handle_read(&mut self, packet: Bytes) -> Result<(), SessionError> {
        if packet.is_empty() {
            return Err(SessionError::EmptyPacket);
        }
        if !is_cga(&packet, &self.peer, &self.local) {
            return Err(SessionError::AddressNotAllowed);
        }
        self.writer.write(packet);
        Ok(())
    }

    fn handle_write(&mut self, packet: Bytes) -> Result<(), SessionError> {
        if !is_cga(&packet, &self.local, &self.peer) {
            return Err(SessionError::AddressNotAllowed);
        }
        let tx = self.own_tx.clone();
        self.conn.write(
            packet,
            Box::new(move |result| {
                if let Err(e) = result {
                    let _ = tx.send(SessionMsg::WriteFailed(e));
                }
            }),
        );
        Ok(())
    }

    fn handle_write_failure(&mut self, err: ConnError) {
        match err {
            // No fragmentation and no Packet Too Big reply; the packet is lost.
            ConnError::PacketTooBig { max_size } => {
                tracing::warn!(id = %self.id, max_size, "packet too big for connection, dropped");
            }
            ConnError::Closed => {
                tracing::debug!(id = %self.id, "connection closed under session");
                self.request_close();
            }
            ConnError::Other(reason) => {
                tracing::error!(
                    id = %self.id,
                    conn = %self.conn.describe(),
                    %reason,
                    "connection write failed"
                );
            }
        }
    }

    /// Closing goes through the adapter so both tables are updated first.
    fn request_close(&mut self) {
        if self.close_requested {
            return;
        }
        self.close_requested = true;
        let msg = AdapterMsg::CloseSession {
            id: self.id,
            peer: self.peer,
        };
        if self.adapter.send(msg).is_err() {
            // No adapter left to hand us a Close.
            let _ = self.own_tx.send(SessionMsg::Close);
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session was already closed")]
    Closed,

    #[error("read packet with 0 size")]
    EmptyPacket,

    #[error("address not allowed")]
    AddressNotAllowed,
}
