//! tapmux-core provides addressing, packet inspection, identity keys, configuration,
//! and the contract with the mesh core. The router crate depends on this one.

pub mod address;
pub mod config;
pub mod crypto;
pub mod mesh;
pub mod packet;

pub use address::{Address, NodeAddrs, NodeId, PublicKey, Subnet};
pub use mesh::{ConnError, Connection, Dialer, Listener, MeshCore, MeshError, MeshHandles};
