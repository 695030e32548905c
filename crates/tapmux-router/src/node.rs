//! Node: the application-facing entry point.
//!
//! Brings up a mesh core under the configured identity, wires an adapter to
//! it and keeps the application end of the conduit. Raw IPv6 packets go in
//! with `send` and come out with `recv`.

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use tapmux_core::config::{ConfigError, TapmuxConfig};
use tapmux_core::crypto::{parse_key, Keypair};
use tapmux_core::{MeshCore, MeshError};

use crate::adapter::{Adapter, AdapterError};
use crate::conduit::{self, ConduitEndpoint, ConduitError};

pub struct Node {
    adapter: Adapter,
    endpoint: ConduitEndpoint,
}

impl Node {
    pub fn start(config: TapmuxConfig, core: &dyn MeshCore) -> Result<Self, NodeError> {
        let keypair = config.keypair()?;
        tracing::debug!(address = %keypair.addrs().address, "starting mesh core");
        let (listener, dialer) = core.start(&keypair)?;
        let (conduit, endpoint) = conduit::pair();
        let adapter = Adapter::builder()
            .config(config)
            .listener(listener)
            .dialer(dialer)
            .conduit(conduit)
            .start()?;
        Ok(Self { adapter, endpoint })
    }

    /// Start from a JSON document laid over a freshly generated config.
    /// Anything the document leaves out keeps its generated value.
    pub fn start_json(json: &str, core: &dyn MeshCore) -> Result<Self, NodeError> {
        Self::start(config_from_json(json)?, core)
    }

    /// Start with a throwaway identity and default settings.
    pub fn start_autoconfigure(core: &dyn MeshCore) -> Result<Self, NodeError> {
        Self::start(TapmuxConfig::generate(), core)
    }

    /// Copy `packet` into the router.
    pub async fn send(&self, packet: &[u8]) -> Result<(), NodeError> {
        Ok(self.endpoint.send(packet).await?)
    }

    /// Next packet the router delivers to the application.
    pub async fn recv(&mut self) -> Result<Bytes, NodeError> {
        Ok(self.endpoint.recv().await?)
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    pub fn address_string(&self) -> String {
        self.adapter.address().to_string()
    }

    pub fn subnet_string(&self) -> String {
        self.adapter.subnet().to_string()
    }

    pub fn public_key_string(&self) -> String {
        hex::encode(self.adapter.public_key())
    }

    pub async fn stop(&self) -> Result<(), NodeError> {
        Ok(self.adapter.stop().await?)
    }
}

/// A fresh config, pretty-printed as JSON.
pub fn generate_config_json() -> Result<String, NodeError> {
    Ok(serde_json::to_string_pretty(&TapmuxConfig::generate())?)
}

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Lay `json` over a generated config.
pub fn config_from_json(json: &str) -> Result<TapmuxConfig, NodeError> {
    let overlay: Value = serde_json::from_str(json)?;
    let private_only = overlay.pointer("/identity/private_key").is_some()
        && overlay.pointer("/identity/public_key").is_none();

    let mut merged = serde_json::to_value(TapmuxConfig::generate())?;
    merge(&mut merged, overlay);
    let mut config: TapmuxConfig = serde_json::from_value(merged)?;

    // The generated public key belongs to a different private key.
    if private_only {
        let private = parse_key(&config.identity.private_key).map_err(ConfigError::from)?;
        config.identity.public_key = hex::encode(Keypair::from_private(private).public);
    }
    Ok(config)
}

fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                merge(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (slot, value) => *slot = value,
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("mesh core failed to start: {0}")]
    Mesh(#[from] MeshError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Conduit(#[from] ConduitError),

    #[error("bad JSON config: {0}")]
    Json(#[from] serde_json::Error),
}
