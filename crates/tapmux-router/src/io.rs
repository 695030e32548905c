//! Reader and writer: the two actors that sit on the conduit.
//!
//! The reader pulls application packets and posts them to the adapter one at
//! a time. The writer owns the application-facing half and drains a mailbox
//! that every session may post to; each sender's packets come out in the
//! order it queued them. The mailbox is bounded: while the application is
//! not reading, packets past `WRITER_QUEUE_LEN` are dropped.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::adapter::AdapterMsg;
use crate::conduit::{ConduitError, ConduitReader, ConduitWriter};

/// Packets the writer holds for the application before it starts dropping.
pub const WRITER_QUEUE_LEN: usize = 256;

// ── Reader ────────────────────────────────────────────────────────────────────

pub(crate) struct Reader {
    conduit: ConduitReader,
    adapter: mpsc::UnboundedSender<AdapterMsg>,
}

impl Reader {
    pub(crate) fn new(conduit: ConduitReader, adapter: mpsc::UnboundedSender<AdapterMsg>) -> Self {
        Self { conduit, adapter }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let packet = match self.conduit.read().await {
                Ok(p) => p,
                Err(ConduitError::Closed) => {
                    tracing::debug!("conduit closed, reader exiting");
                    return;
                }
            };
            // A zero-length read means the application has nothing more to say.
            if packet.is_empty() {
                tracing::debug!("empty read from conduit, reader exiting");
                return;
            }
            if self.adapter.send(AdapterMsg::Packet(packet)).is_err() {
                tracing::debug!("adapter gone, reader exiting");
                return;
            }
        }
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Mailbox handle for the writer. Cheap to clone.
#[derive(Clone)]
pub(crate) struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
}

impl WriterHandle {
    /// Never waits; a full queue drops the packet.
    pub(crate) fn write(&self, packet: Bytes) {
        match self.tx.try_send(packet) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(packet)) => {
                tracing::debug!(len = packet.len(), "writer queue full, dropping packet");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!("writer stopped, dropping packet");
            }
        }
    }
}

pub(crate) struct Writer {
    conduit: ConduitWriter,
    inbox: mpsc::Receiver<Bytes>,
}

impl Writer {
    pub(crate) fn new(conduit: ConduitWriter) -> (Self, WriterHandle) {
        let (tx, inbox) = mpsc::channel(WRITER_QUEUE_LEN);
        (Self { conduit, inbox }, WriterHandle { tx })
    }

    pub(crate) async fn run(mut self) {
        while let Some(packet) = self.inbox.recv().await {
            let len = packet.len();
            match self.conduit.write(packet).await {
                Ok(written) if written != len => {
                    tracing::error!(written, len, "short write to conduit");
                }
                Ok(_) => {}
                Err(ConduitError::Closed) => {
                    // Only happens while the adapter is shutting down.
                    tracing::debug!("conduit closed, writer exiting");
                    return;
                }
            }
        }
        tracing::debug!("all writer handles dropped, writer exiting");
    }
}
