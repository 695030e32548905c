//! tapmux-router multiplexes application IPv6 traffic onto per-peer mesh
//! sessions.
//!
//! The application exchanges raw packets with a `Conduit`. The `Adapter`
//! reads them, picks or dials the session for each destination and hands
//! return traffic back through the same conduit.

pub mod adapter;
pub mod conduit;
mod dial;
mod io;
pub mod node;
pub mod session;

pub use adapter::{Adapter, AdapterBuilder, AdapterError, AdapterSnapshot, InterfaceInfo};
pub use conduit::{Conduit, ConduitEndpoint, ConduitError};
pub use dial::DIAL_BUFFER_LEN;
pub use io::WRITER_QUEUE_LEN;
pub use node::{Node, NodeError};
pub use session::{SessionError, SessionHandle, SessionId, SESSION_IDLE_TIMEOUT};
