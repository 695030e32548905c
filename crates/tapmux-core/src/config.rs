//! Configuration system for tapmux.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TAPMUX_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tapmux/config.toml
//!   3. ~/.config/tapmux/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::address::PublicKey;
use crate::crypto::{parse_key, parse_public_key, CryptoError, Keypair};

/// Default interface MTU.
pub const DEFAULT_MTU: u16 = 65535;

/// Largest MTU the conduit can carry.
pub const MAXIMUM_MTU: u16 = 65535;

/// Smallest MTU IPv6 allows.
pub const MINIMUM_MTU: u16 = 1280;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TapmuxConfig {
    pub identity: IdentityConfig,
    pub interface: InterfaceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// X25519 public key (hex). Addresses derive from this.
    pub public_key: String,
    /// X25519 private key (hex). Handed to the mesh core, never used here.
    pub private_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceConfig {
    /// Adapter name reported to callers.
    pub name: String,
    /// Interface MTU. Clamped to [MINIMUM_MTU, MAXIMUM_MTU].
    pub mtu: u16,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TapmuxConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            interface: InterfaceConfig::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            public_key: String::new(),
            private_key: String::new(),
        }
    }
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: "dummy".to_string(),
            mtu: DEFAULT_MTU,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("tapmux")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid identity key: {0}")]
    BadKey(#[from] CryptoError),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TapmuxConfig {
    /// A config with a freshly generated identity.
    pub fn generate() -> Self {
        let keypair = Keypair::generate();
        let mut config = Self::default();
        config.identity.public_key = hex::encode(keypair.public);
        config.identity.private_key = hex::encode(*keypair.private_bytes());
        config
    }

    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            let config: TapmuxConfig = toml::from_str(&text)
                .map_err(|e| ConfigError::ParseFailed(path.clone(), e))?;
            tracing::debug!(path = %path.display(), "loaded config file");
            config
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            TapmuxConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TAPMUX_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write a generated config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&TapmuxConfig::generate())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// The configured public key, parsed.
    pub fn public_key(&self) -> Result<PublicKey, ConfigError> {
        Ok(parse_public_key(&self.identity.public_key)?)
    }

    /// The configured keypair. The public half must agree with the private
    /// half when both are set.
    pub fn keypair(&self) -> Result<Keypair, ConfigError> {
        let keypair = Keypair::from_private(parse_key(&self.identity.private_key)?);
        if !self.identity.public_key.trim().is_empty() && self.public_key()? != keypair.public {
            return Err(ConfigError::BadKey(CryptoError::Mismatch));
        }
        Ok(keypair)
    }

    /// MTU clamped to what the platform supports.
    pub fn supported_mtu(&self) -> u16 {
        self.interface.mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU)
    }

    /// Apply TAPMUX_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TAPMUX_IDENTITY__PUBLIC_KEY") {
            self.identity.public_key = v;
        }
        if let Ok(v) = std::env::var("TAPMUX_IDENTITY__PRIVATE_KEY") {
            self.identity.private_key = v;
        }
        if let Ok(v) = std::env::var("TAPMUX_INTERFACE__NAME") {
            self.interface.name = v;
        }
        if let Ok(v) = std::env::var("TAPMUX_INTERFACE__MTU") {
            if let Ok(m) = v.parse() {
                self.interface.mtu = m;
            }
        }
    }
}
