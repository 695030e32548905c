use crate::*;

use tapmux_router::DIAL_BUFFER_LEN;

/// While a dial is outstanding, packets queue behind it and only one dial is
/// started. They are flushed in order once it connects.
#[tokio::test]
async fn test_packets_wait_for_a_single_dial() -> Result<()> {
    let mesh = MemoryMesh::new();
    let a = start_node(&mesh)?;
    let mut b = start_node(&mesh)?;
    let (node_id, _) = b.addrs.address.node_id_and_mask();
    mesh.hold_dials();

    let mut sent = Vec::new();
    for n in 0u8..3 {
        let packet = a.packet_to(b.addrs.address.0, &[n; 4]);
        a.send(&packet).await?;
        sent.push(packet);
    }

    a.wait_until("three held packets", |s| s.pending_for(&node_id) == Some(3))
        .await?;
    assert_eq!(mesh.dials_started(), 1);

    mesh.release_dials();
    for packet in sent {
        assert_eq!(b.recv().await?, Bytes::from(packet));
    }
    a.wait_until("dial resolved", |s| s.pending_dials.is_empty())
        .await?;
    assert_eq!(mesh.dials_started(), 1);
    Ok(())
}

/// The per-dial buffer keeps only the newest packets.
#[tokio::test]
async fn test_dial_buffer_drops_oldest_when_full() -> Result<()> {
    let mesh = MemoryMesh::new();
    let a = start_node(&mesh)?;
    let mut b = start_node(&mesh)?;
    let (node_id, _) = b.addrs.address.node_id_and_mask();
    mesh.hold_dials();

    let total = DIAL_BUFFER_LEN as u8 + 8;
    for n in 0..total {
        a.send(&a.packet_to(b.addrs.address.0, &[n])).await?;
    }
    a.wait_until("a full buffer", |s| {
        s.pending_for(&node_id) == Some(DIAL_BUFFER_LEN)
    })
    .await?;
    // Let the last packet land before releasing.
    tokio::time::sleep(Duration::from_millis(20)).await;

    mesh.release_dials();
    for n in 8..total {
        let got = b.recv().await?;
        assert_eq!(got[got.len() - 1], n);
    }
    b.assert_silent().await
}

/// A failed dial drops what it held; the next packet starts a fresh dial.
#[tokio::test]
async fn test_failed_dial_discards_buffer_and_allows_retry() -> Result<()> {
    let mesh = MemoryMesh::new();
    let a = start_node(&mesh)?;
    let nobody = NodeAddrs::for_key(&[9u8; 32]);

    a.send(&a.packet_to(nobody.address.0, b"lost")).await?;
    eventually("first dial", || mesh.dials_started() == 1).await?;
    a.wait_until("failed dial cleared", |s| s.pending_dials.is_empty())
        .await?;

    a.send(&a.packet_to(nobody.address.0, b"retry")).await?;
    eventually("second dial", || mesh.dials_started() == 2).await?;
    let snapshot = a
        .wait_until("failed dial cleared", |s| s.pending_dials.is_empty())
        .await?;
    assert_eq!(snapshot.session_count(), 0);
    Ok(())
}

/// A peer that left the mesh can no longer be dialed.
#[tokio::test]
async fn test_dial_to_departed_peer_fails() -> Result<()> {
    let mesh = MemoryMesh::new();
    let a = start_node(&mesh)?;
    let c = raw_peer(&mesh, 5);
    mesh.leave(&c.key);

    a.send(&a.packet_to(c.addrs.address.0, b"gone")).await?;
    eventually("dial attempted", || mesh.dials_started() == 1).await?;
    let snapshot = a
        .wait_until("failed dial cleared", |s| s.pending_dials.is_empty())
        .await?;
    assert_eq!(snapshot.session_count(), 0);
    assert!(c.accept().await.is_err());
    Ok(())
}

/// Dialing by subnet finds the node owning that /64.
#[tokio::test]
async fn test_subnet_dial_lands_on_subnet_owner() -> Result<()> {
    let mesh = MemoryMesh::new();
    let a = start_node(&mesh)?;
    let c = raw_peer(&mesh, 5);

    a.send(&a.packet_to(subnet_host(&c.addrs, 1), b"to subnet"))
        .await?;
    let conn = c.accept().await?;
    assert_eq!(conn.remote_key(), a.key);

    let snapshot = a
        .wait_until("dialed session", |s| s.session_count() == 1)
        .await?;
    assert!(snapshot.session_for_subnet(&c.addrs.subnet).is_some());
    assert!(snapshot.session_for_address(&c.addrs.address).is_some());
    Ok(())
}

/// Packets for two different targets wait on two independent dials.
#[tokio::test]
async fn test_dials_are_tracked_per_target() -> Result<()> {
    let mesh = MemoryMesh::new();
    let a = start_node(&mesh)?;
    let mut b = start_node(&mesh)?;
    let mut c = start_node(&mesh)?;
    mesh.hold_dials();

    let to_b = a.packet_to(b.addrs.address.0, b"for b");
    let to_c = a.packet_to(c.addrs.address.0, b"for c");
    a.send(&to_b).await?;
    a.send(&to_c).await?;
    a.wait_until("two pending dials", |s| s.pending_dials.len() == 2)
        .await?;
    assert_eq!(mesh.dials_started(), 2);

    mesh.release_dials();
    assert_eq!(b.recv().await?, Bytes::from(to_b));
    assert_eq!(c.recv().await?, Bytes::from(to_c));
    Ok(())
}
