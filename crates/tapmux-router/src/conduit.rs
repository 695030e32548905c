//! Conduit: the packet pipe between the application and the router.
//!
//! Two capacity-one channels, one per direction, so there is never more than
//! one packet in flight each way. Closing wakes every pending read or write
//! on both sides with `ConduitError::Closed`.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Create a connected router side and application side.
pub fn pair() -> (Conduit, ConduitEndpoint) {
    let (to_app, app_rx) = mpsc::channel(1);
    let (app_tx, from_app) = mpsc::channel(1);
    let (closed_tx, closed) = watch::channel(false);
    let closer = ConduitCloser {
        closed: Arc::new(closed_tx),
    };

    let conduit = Conduit {
        reader: ConduitReader {
            rx: from_app,
            closed: closed.clone(),
        },
        writer: ConduitWriter {
            tx: to_app,
            closed: closed.clone(),
        },
        closer,
    };
    let endpoint = ConduitEndpoint {
        rx: app_rx,
        tx: app_tx,
        closed,
    };
    (conduit, endpoint)
}

/// Router side.
pub struct Conduit {
    reader: ConduitReader,
    writer: ConduitWriter,
    closer: ConduitCloser,
}

impl Conduit {
    /// Wait for the next packet from the application.
    pub async fn read(&mut self) -> Result<Bytes, ConduitError> {
        self.reader.read().await
    }

    /// Hand a packet to the application. Returns the number of bytes written.
    pub async fn write(&self, packet: Bytes) -> Result<usize, ConduitError> {
        self.writer.write(packet).await
    }

    pub fn close(&self) {
        self.closer.close();
    }

    pub fn into_parts(self) -> (ConduitReader, ConduitWriter, ConduitCloser) {
        (self.reader, self.writer, self.closer)
    }
}

pub struct ConduitReader {
    rx: mpsc::Receiver<Bytes>,
    closed: watch::Receiver<bool>,
}

impl ConduitReader {
    pub async fn read(&mut self) -> Result<Bytes, ConduitError> {
        tokio::select! {
            biased;
            _ = wait_closed(&mut self.closed) => Err(ConduitError::Closed),
            packet = self.rx.recv() => packet.ok_or(ConduitError::Closed),
        }
    }
}

pub struct ConduitWriter {
    tx: mpsc::Sender<Bytes>,
    closed: watch::Receiver<bool>,
}

impl ConduitWriter {
    pub async fn write(&self, packet: Bytes) -> Result<usize, ConduitError> {
        let len = packet.len();
        let mut closed = self.closed.clone();
        tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => Err(ConduitError::Closed),
            sent = self.tx.send(packet) => sent.map(|_| len).map_err(|_| ConduitError::Closed),
        }
    }
}

/// Closes both directions. Cheap to clone.
#[derive(Clone)]
pub struct ConduitCloser {
    closed: Arc<watch::Sender<bool>>,
}

impl ConduitCloser {
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Application side.
pub struct ConduitEndpoint {
    rx: mpsc::Receiver<Bytes>,
    tx: mpsc::Sender<Bytes>,
    closed: watch::Receiver<bool>,
}

impl ConduitEndpoint {
    /// Send a packet into the router. The payload is copied, so the caller
    /// may reuse its buffer as soon as this returns.
    pub async fn send(&self, packet: &[u8]) -> Result<(), ConduitError> {
        let packet = Bytes::copy_from_slice(packet);
        let mut closed = self.closed.clone();
        tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => Err(ConduitError::Closed),
            sent = self.tx.send(packet) => sent.map_err(|_| ConduitError::Closed),
        }
    }

    /// Wait for the next packet from the router.
    pub async fn recv(&mut self) -> Result<Bytes, ConduitError> {
        tokio::select! {
            biased;
            _ = wait_closed(&mut self.closed) => Err(ConduitError::Closed),
            packet = self.rx.recv() => packet.ok_or(ConduitError::Closed),
        }
    }
}

/// Resolves once the conduit is closed or every closer has been dropped.
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConduitError {
    #[error("conduit closed")]
    Closed,
}
