//! tapmuxd runs a local node and an echo peer over an in-memory mesh.
//!
//! The local node pings the peer once a second through its conduit. The
//! peer turns each packet around. Round trips and a periodic view of the
//! session tables are logged until ctrl-c.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use tapmux_core::config::TapmuxConfig;
use tapmux_core::mesh::memory::MemoryMesh;
use tapmux_core::packet::{build_ipv6, IPV6_HEADER_LEN};
use tapmux_router::node::{self, Node};

const PING_INTERVAL: Duration = Duration::from_secs(1);
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = TapmuxConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = TapmuxConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TapmuxConfig::default()
    });
    if let Err(e) = config.keypair() {
        tracing::warn!(error = %e, "no usable identity configured, generating one");
        config.identity = TapmuxConfig::generate().identity;
    }
    tracing::info!(version = node::version(), "tapmuxd starting");

    let mesh = MemoryMesh::new();
    let mut local = Node::start(config, &mesh).context("failed to start local node")?;
    let peer = Node::start_autoconfigure(&mesh).context("failed to start echo peer")?;

    tracing::info!(
        address = local.address_string(),
        subnet = local.subnet_string(),
        public_key = local.public_key_string(),
        name = local.adapter().name(),
        mtu = local.adapter().mtu(),
        "local node ready"
    );
    tracing::info!(address = peer.address_string(), "echo peer ready");

    let source = local.adapter().address().0;
    let target = peer.adapter().address().0;
    let peer_adapter = peer.adapter().clone();
    let echo_task = tokio::spawn(echo(peer));

    // ── Ping loop ────────────────────────────────────────────────────────────

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ping = tokio::time::interval(PING_INTERVAL);
    let mut snapshot = tokio::time::interval(SNAPSHOT_INTERVAL);
    let mut in_flight: HashMap<u64, Instant> = HashMap::new();
    let mut seq: u64 = 0;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutting down");
                break;
            }

            _ = ping.tick() => {
                seq += 1;
                local
                    .send(&build_ipv6(source, target, &seq.to_be_bytes()))
                    .await
                    .context("conduit closed while pinging")?;
                in_flight.insert(seq, Instant::now());
            }

            reply = local.recv() => {
                let reply = reply.context("conduit closed while waiting for replies")?;
                let echoed = reply
                    .get(IPV6_HEADER_LEN..IPV6_HEADER_LEN + 8)
                    .and_then(|b| b.try_into().ok())
                    .map(u64::from_be_bytes);
                match echoed.and_then(|n| in_flight.remove(&n).map(|sent| (n, sent))) {
                    Some((n, sent)) => {
                        tracing::info!(seq = n, rtt_us = sent.elapsed().as_micros() as u64, "pong");
                    }
                    None => tracing::debug!(len = reply.len(), "unexpected packet"),
                }
            }

            _ = snapshot.tick() => {
                let tables = local.adapter().snapshot().await?;
                in_flight.retain(|_, sent| sent.elapsed() < SNAPSHOT_INTERVAL);
                tracing::info!(
                    sessions = tables.session_count(),
                    pending_dials = tables.pending_dials.len(),
                    unanswered = in_flight.len(),
                    "session snapshot"
                );
            }
        }
    }

    local.stop().await?;
    peer_adapter.stop().await?;
    if let Err(e) = echo_task.await {
        tracing::warn!(error = %e, "echo task failed");
    }
    Ok(())
}

/// Send every packet back with source and destination swapped.
async fn echo(mut peer: Node) {
    loop {
        let mut packet = match peer.recv().await {
            Ok(p) => p.to_vec(),
            Err(e) => {
                tracing::debug!(error = %e, "echo peer exiting");
                return;
            }
        };
        if packet.len() < IPV6_HEADER_LEN {
            continue;
        }
        let (src, dst) = packet[8..40].split_at_mut(16);
        src.swap_with_slice(dst);
        if peer.send(&packet).await.is_err() {
            return;
        }
    }
}
