//! IPv6 header inspection: just enough to route and to check ownership.
//!
//! The router never rewrites packets. It reads the version nibble, the
//! payload length, and the two addresses, then hands the original bytes on.
//! The header type is #[repr(C, packed)] with zerocopy derives so a prefix of
//! the packet can be viewed without copying. There is no unsafe code here.

use static_assertions::assert_eq_size;
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::address::{Address, NodeAddrs, Subnet, ADDRESS_PREFIX, SUBNET_PREFIX};

pub const IPV6_HEADER_LEN: usize = 40;
pub const IPV4_HEADER_LEN: usize = 20;

/// Largest packet the conduit carries.
pub const MAX_PACKET_LEN: usize = 65535;

// ── Header ────────────────────────────────────────────────────────────────────

/// Fixed IPv6 header (RFC 8200 §3).
///
/// Wire size: 40 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct Ipv6Header {
    /// version (4 bits) | traffic class (8 bits) | flow label (20 bits)
    pub version_class_flow: [u8; 4],

    /// Length of everything after this header, big-endian.
    pub payload_length: [u8; 2],

    pub next_header: u8,

    pub hop_limit: u8,

    pub source: [u8; 16],

    pub destination: [u8; 16],
}

assert_eq_size!(Ipv6Header, [u8; IPV6_HEADER_LEN]);

impl Ipv6Header {
    /// Build a header for a payload of `payload_len` bytes.
    pub fn new(source: [u8; 16], destination: [u8; 16], payload_len: u16) -> Self {
        Self {
            version_class_flow: [0x60, 0, 0, 0],
            payload_length: payload_len.to_be_bytes(),
            next_header: 59, // no next header
            hop_limit: 64,
            source,
            destination,
        }
    }

    pub fn version(&self) -> u8 {
        self.version_class_flow[0] >> 4
    }

    pub fn payload_len(&self) -> usize {
        u16::from_be_bytes(self.payload_length) as usize
    }
}

/// Assemble a full IPv6 packet around `payload`.
pub fn build_ipv6(source: [u8; 16], destination: [u8; 16], payload: &[u8]) -> Vec<u8> {
    let header = Ipv6Header::new(source, destination, payload.len() as u16);
    let mut packet = Vec::with_capacity(IPV6_HEADER_LEN + payload.len());
    packet.extend_from_slice(header.as_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// IP version from the first nibble. `None` for an empty buffer.
pub fn ip_version(bs: &[u8]) -> Option<u8> {
    bs.first().map(|b| b >> 4)
}

// ── Classification ────────────────────────────────────────────────────────────

/// Where an outbound packet should go, in both lookup forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    pub address: Address,
    pub subnet: Subnet,
}

/// Reasons a packet from the conduit is not routable. All of them are
/// silent drops.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,

    #[error("IPv{version} packet of {len} bytes is shorter than its header")]
    TooShort { version: u8, len: usize },

    #[error("declared length {declared} does not match actual length {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("IPv4 is not supported")]
    Ipv4Unsupported,

    #[error("unknown IP version {0}")]
    UnknownVersion(u8),

    #[error("destination is neither a mesh address nor a mesh subnet")]
    NotMeshAddress,
}

/// Validate framing and pull out the destination in both forms.
pub fn classify(bs: &[u8]) -> Result<Destination, PacketError> {
    let n = bs.len();
    match ip_version(bs) {
        None => Err(PacketError::Empty),
        Some(6) => {
            let header = Ipv6Header::read_from_prefix(bs).ok_or(PacketError::TooShort {
                version: 6,
                len: n,
            })?;
            let declared = header.payload_len();
            if n - IPV6_HEADER_LEN != declared {
                return Err(PacketError::LengthMismatch {
                    declared,
                    actual: n - IPV6_HEADER_LEN,
                });
            }
            let destination = header.destination;
            let address = Address(destination);
            let mut snet = [0u8; 8];
            snet.copy_from_slice(&destination[..8]);
            let subnet = Subnet(snet);
            if !address.is_valid() && !subnet.is_valid() {
                return Err(PacketError::NotMeshAddress);
            }
            Ok(Destination { address, subnet })
        }
        Some(4) => {
            if n < IPV4_HEADER_LEN {
                return Err(PacketError::TooShort { version: 4, len: n });
            }
            let declared = u16::from_be_bytes([bs[2], bs[3]]) as usize;
            if n != declared {
                return Err(PacketError::LengthMismatch {
                    declared,
                    actual: n,
                });
            }
            Err(PacketError::Ipv4Unsupported)
        }
        Some(v) => Err(PacketError::UnknownVersion(v)),
    }
}

// ── Ownership check ───────────────────────────────────────────────────────────

/// Returns true if `bs` is an IPv6 packet whose source belongs to `source`
/// and whose destination belongs to `destination`.
///
/// Each side may be named by its full address (first byte 0x02, all 16
/// bytes compared) or by its subnet (first byte 0x03, first 8 bytes
/// compared). A header-only packet is not accepted.
pub fn is_cga(bs: &[u8], source: &NodeAddrs, destination: &NodeAddrs) -> bool {
    let ipv6 = bs.len() > IPV6_HEADER_LEN && ip_version(bs) == Some(6);
    ipv6 && owns(&bs[8..24], source) && owns(&bs[24..40], destination)
}

fn owns(field: &[u8], addrs: &NodeAddrs) -> bool {
    match field[0] {
        ADDRESS_PREFIX => field == addrs.address.as_bytes(),
        SUBNET_PREFIX => field[..8] == addrs.subnet.as_bytes()[..],
        _ => false,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
