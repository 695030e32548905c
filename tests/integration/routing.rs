use crate::*;

use tapmux_core::packet::IPV6_HEADER_LEN;
use tapmux_router::Node;

/// A packet addressed to a peer's mesh address comes out of the peer's
/// conduit unchanged.
#[tokio::test]
async fn test_packet_reaches_peer_by_address() -> Result<()> {
    let mesh = MemoryMesh::new();
    let a = start_node(&mesh)?;
    let mut b = start_node(&mesh)?;

    let packet = a.packet_to(b.addrs.address.0, b"hello by address");
    a.send(&packet).await?;

    assert_eq!(b.recv().await?, Bytes::from(packet));
    assert_eq!(mesh.dials_started(), 1);
    Ok(())
}

/// Any host inside a peer's /64 routes to that peer.
#[tokio::test]
async fn test_packet_reaches_peer_by_subnet() -> Result<()> {
    let mesh = MemoryMesh::new();
    let a = start_node(&mesh)?;
    let mut b = start_node(&mesh)?;

    let packet = a.packet_to(subnet_host(&b.addrs, 42), b"hello by subnet");
    a.send(&packet).await?;

    assert_eq!(b.recv().await?, Bytes::from(packet));
    Ok(())
}

/// The receiving side answers over the session it wrapped on accept rather
/// than dialing back.
#[tokio::test]
async fn test_reply_reuses_inbound_session() -> Result<()> {
    let mesh = MemoryMesh::new();
    let mut a = start_node(&mesh)?;
    let mut b = start_node(&mesh)?;

    a.send(&a.packet_to(b.addrs.address.0, b"ping")).await?;
    b.recv().await?;

    let reply = b.packet_to(a.addrs.address.0, b"pong");
    b.send(&reply).await?;
    assert_eq!(a.recv().await?, Bytes::from(reply));
    assert_eq!(mesh.dials_started(), 1);

    let snapshot = b.adapter.snapshot().await?;
    assert!(snapshot.session_for_address(&a.addrs.address).is_some());
    assert!(snapshot.session_for_subnet(&a.addrs.subnet).is_some());
    Ok(())
}

/// Later packets to the same peer go straight to the established session.
#[tokio::test]
async fn test_established_session_carries_a_stream_in_order() -> Result<()> {
    let mesh = MemoryMesh::new();
    let a = start_node(&mesh)?;
    let mut b = start_node(&mesh)?;

    let mut sent = Vec::new();
    for n in 0u8..20 {
        let packet = a.packet_to(b.addrs.address.0, &[n; 8]);
        a.send(&packet).await?;
        sent.push(packet);
    }
    for packet in sent {
        assert_eq!(b.recv().await?, Bytes::from(packet));
    }
    assert_eq!(mesh.dials_started(), 1);
    Ok(())
}

/// IPv4, short, mis-sized and non-mesh packets are dropped without dialing.
#[tokio::test]
async fn test_unroutable_packets_are_dropped() -> Result<()> {
    let mesh = MemoryMesh::new();
    let a = start_node(&mesh)?;
    let mut b = start_node(&mesh)?;

    let mut ipv4 = vec![0u8; 28];
    ipv4[0] = 0x45;
    ipv4[3] = 28;
    a.send(&ipv4).await?;

    a.send(&[0x60, 0, 0]).await?;

    let mut mis_sized = a.packet_to(b.addrs.address.0, b"payload");
    mis_sized.push(0);
    a.send(&mis_sized).await?;

    let mut elsewhere = [0u8; 16];
    elsewhere[0] = 0xfd;
    a.send(&a.packet_to(elsewhere, b"not mesh")).await?;

    // A valid packet afterwards proves the reader is still going.
    let good = a.packet_to(b.addrs.address.0, b"fine");
    a.send(&good).await?;
    assert_eq!(b.recv().await?, Bytes::from(good));
    assert_eq!(mesh.dials_started(), 1);
    Ok(())
}

/// A connected peer cannot inject traffic claiming another node's source.
#[tokio::test]
async fn test_spoofed_source_is_dropped_by_receiver() -> Result<()> {
    let mesh = MemoryMesh::new();
    let mut a = start_node(&mesh)?;
    let other = start_node(&mesh)?;
    let c = raw_peer(&mesh, 3);

    let conn = c.connect(&mesh, &a)?;
    let spoofed = build_ipv6(other.addrs.address.0, a.addrs.address.0, b"spoof");
    conn.send(spoofed)?;
    a.assert_silent().await?;

    let genuine = c.packet_to(a.addrs.address.0, b"genuine");
    conn.send(genuine.clone())?;
    assert_eq!(a.recv().await?, Bytes::from(genuine));
    Ok(())
}

/// A peer may only reach addresses this node actually owns.
#[tokio::test]
async fn test_inbound_packet_for_foreign_destination_is_dropped() -> Result<()> {
    let mesh = MemoryMesh::new();
    let mut a = start_node(&mesh)?;
    let other = start_node(&mesh)?;
    let c = raw_peer(&mesh, 4);

    let conn = c.connect(&mesh, &a)?;
    conn.send(c.packet_to(other.addrs.address.0, b"misrouted"))?;
    a.assert_silent().await?;

    // Anything in our own /64 is fine.
    let to_subnet = c.packet_to(subnet_host(&a.addrs, 7), b"subnet host");
    conn.send(to_subnet.clone())?;
    assert_eq!(a.recv().await?, Bytes::from(to_subnet));
    Ok(())
}

/// Two nodes started through the JSON facade can exchange packets.
#[tokio::test]
async fn test_nodes_started_from_json_exchange_packets() -> Result<()> {
    let mesh = MemoryMesh::new();
    let overlay = serde_json::json!({ "interface": { "name": "mesh0", "mtu": 1500 } });
    let a = Node::start_json(&overlay.to_string(), &mesh).context("json node")?;
    let mut b = Node::start_autoconfigure(&mesh).context("autoconfigured node")?;

    assert_eq!(a.adapter().name(), "mesh0");
    assert_eq!(a.adapter().mtu(), 1500);

    let dst: std::net::Ipv6Addr = b.address_string().parse()?;
    let src: std::net::Ipv6Addr = a.address_string().parse()?;
    let packet = build_ipv6(src.octets(), dst.octets(), b"via facade");
    a.send(&packet).await?;

    let got = tokio::time::timeout(RECV_TIMEOUT, b.recv())
        .await
        .context("timed out waiting for a packet")??;
    assert_eq!(&got[IPV6_HEADER_LEN..], b"via facade");

    a.stop().await?;
    b.stop().await?;
    Ok(())
}
