//! Mesh addressing: node ids, addresses and subnets derived from a key.
//!
//!   node_id = SHA-512(public_key)
//!   address = [0x02, ones, node_id bits after the first zero...]  (200::/7)
//!   subnet  = first 8 bytes of the address with prefix 0x03       (300::/7)
//!
//! `ones` counts the leading one-bits of the node id. The zero that ends the
//! run is implied and dropped; the address carries the next 112 bits.
//! Reversing the derivation yields a partial node id plus a mask of the bits
//! the address actually pins down, which is what dialing by address needs.

use std::fmt;
use std::net::Ipv6Addr;

use sha2::{Digest, Sha512};

/// A peer's long-term public key as handed over by the mesh core.
pub type PublicKey = [u8; 32];

/// First byte of every single-host mesh address.
pub const ADDRESS_PREFIX: u8 = 0x02;

/// First byte of every routed /64 mesh subnet.
pub const SUBNET_PREFIX: u8 = 0x03;

pub const NODE_ID_LEN: usize = 64;
const NODE_ID_BITS: usize = NODE_ID_LEN * 8;

// ── Node ID ───────────────────────────────────────────────────────────────────

/// SHA-512 digest of a public key; the mesh routes on these.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    pub fn for_key(key: &PublicKey) -> Self {
        let digest = Sha512::digest(key);
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(&digest);
        Self(id)
    }

    /// True if every bit set in `mask` agrees between `self` and `target`.
    pub fn matches(&self, target: &NodeId, mask: &NodeId) -> bool {
        self.0
            .iter()
            .zip(target.0.iter())
            .zip(mask.0.iter())
            .all(|((a, b), m)| (a ^ b) & m == 0)
    }

    /// Short hex form for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

// ── Address ───────────────────────────────────────────────────────────────────

/// A full 128-bit mesh address (200::/7).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(pub [u8; 16]);

impl Address {
    pub fn for_node_id(id: &NodeId) -> Self {
        Self(derive(id, ADDRESS_PREFIX))
    }

    pub fn for_key(key: &PublicKey) -> Self {
        Self::for_node_id(&NodeId::for_key(key))
    }

    pub fn is_valid(&self) -> bool {
        self.0[0] == ADDRESS_PREFIX
    }

    /// Partial node id recovered from this address, and the mask of bits it
    /// determines.
    pub fn node_id_and_mask(&self) -> (NodeId, NodeId) {
        node_id_and_mask(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Ipv6Addr::from(self.0), f)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

// ── Subnet ────────────────────────────────────────────────────────────────────

/// The routed /64 that belongs to a node (300::/7).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet(pub [u8; 8]);

impl Subnet {
    pub fn for_node_id(id: &NodeId) -> Self {
        let addr = Address::for_node_id(id);
        let mut snet = [0u8; 8];
        snet.copy_from_slice(&addr.0[..8]);
        snet[0] |= 0x01;
        Self(snet)
    }

    pub fn for_key(key: &PublicKey) -> Self {
        Self::for_node_id(&NodeId::for_key(key))
    }

    pub fn is_valid(&self) -> bool {
        self.0[0] == SUBNET_PREFIX
    }

    pub fn node_id_and_mask(&self) -> (NodeId, NodeId) {
        node_id_and_mask(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut full = [0u8; 16];
        full[..8].copy_from_slice(&self.0);
        write!(f, "{}/64", Ipv6Addr::from(full))
    }
}

impl fmt::Debug for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subnet({self})")
    }
}

// ── NodeAddrs ─────────────────────────────────────────────────────────────────

/// Both routable forms of one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAddrs {
    pub address: Address,
    pub subnet: Subnet,
}

impl NodeAddrs {
    pub fn for_node_id(id: &NodeId) -> Self {
        Self {
            address: Address::for_node_id(id),
            subnet: Subnet::for_node_id(id),
        }
    }

    pub fn for_key(key: &PublicKey) -> Self {
        Self::for_node_id(&NodeId::for_key(key))
    }
}

// ── Bit helpers ───────────────────────────────────────────────────────────────

fn bit_at(bytes: &[u8], idx: usize) -> bool {
    bytes[idx / 8] & (0x80 >> (idx % 8)) != 0
}

fn set_bit(bytes: &mut [u8], idx: usize) {
    bytes[idx / 8] |= 0x80 >> (idx % 8);
}

fn derive(id: &NodeId, prefix: u8) -> [u8; 16] {
    let mut ones = 0usize;
    while ones < NODE_ID_BITS && bit_at(&id.0, ones) {
        ones += 1;
    }

    let mut out = [0u8; 16];
    out[0] = prefix;
    out[1] = ones as u8;

    let start = ones + 1;
    for i in 0..(14 * 8) {
        let src = start + i;
        if src >= NODE_ID_BITS {
            break;
        }
        if bit_at(&id.0, src) {
            set_bit(&mut out[2..], i);
        }
    }
    out
}

/// Inverse of `derive` for either form. `bytes` is the 16-byte address or the
/// 8-byte subnet; byte 0 is the prefix and byte 1 the ones count.
fn node_id_and_mask(bytes: &[u8]) -> (NodeId, NodeId) {
    let ones = bytes[1] as usize;
    let mut nid = [0u8; NODE_ID_LEN];
    let mut mask = [0u8; NODE_ID_LEN];

    for idx in 0..ones.min(NODE_ID_BITS) {
        set_bit(&mut nid, idx);
    }

    let nid_offset = ones + 1;
    let addr_offset = 16;
    for idx in addr_offset..bytes.len() * 8 {
        let target = nid_offset + (idx - addr_offset);
        if target >= NODE_ID_BITS {
            break;
        }
        if bit_at(bytes, idx) {
            set_bit(&mut nid, target);
        }
    }

    let mask_bits = (8 * (bytes.len() - 2) + ones + 1).min(NODE_ID_BITS);
    for idx in 0..mask_bits {
        set_bit(&mut mask, idx);
    }

    (NodeId(nid), NodeId(mask))
}
