//! Identity keys.
//!
//! The mesh core owns all session cryptography. This module only manages
//! the node's long-term X25519 keypair, whose public half is the identity
//! every address and subnet is derived from.
//!
//! Key material derives ZeroizeOnDrop and is wiped from memory when dropped.

use thiserror::Error;
use x25519_dalek::{PublicKey as DalekPublic, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::address::{NodeAddrs, NodeId, PublicKey};

/// A node's long-term static X25519 keypair.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    private: Zeroizing<[u8; 32]>,
    pub public: PublicKey,
}

impl Keypair {
    /// Generate a new random X25519 keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = DalekPublic::from(&secret);
        Self {
            private: Zeroizing::new(secret.to_bytes()),
            public: *public.as_bytes(),
        }
    }

    /// Reconstruct a keypair from stored private key bytes.
    /// The public key is derived deterministically from the private key.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = DalekPublic::from(&secret);
        Self {
            private: Zeroizing::new(private_bytes),
            public: *public.as_bytes(),
        }
    }

    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::for_key(&self.public)
    }

    pub fn addrs(&self) -> NodeAddrs {
        NodeAddrs::for_key(&self.public)
    }
}

/// Parse a 32-byte key from hex.
pub fn parse_key(text: &str) -> Result<[u8; 32], CryptoError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(CryptoError::MissingKey);
    }
    let bytes = hex::decode(text)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::WrongLength(bytes.len()))
}

/// Parse a configured public key.
pub fn parse_public_key(text: &str) -> Result<PublicKey, CryptoError> {
    parse_key(text)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("no key configured")]
    MissingKey,

    #[error("key is not valid hex: {0}")]
    BadHex(#[from] hex::FromHexError),

    #[error("key must be 32 bytes, got {0}")]
    WrongLength(usize),

    #[error("public key does not belong to private key")]
    Mismatch,
}
