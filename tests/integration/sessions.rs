use crate::*;

/// An inbound connection is installed under both of the peer's forms.
#[tokio::test]
async fn test_inbound_connection_installs_session() -> Result<()> {
    let mesh = MemoryMesh::new();
    let a = start_node(&mesh)?;
    let c = raw_peer(&mesh, 3);

    let _conn = c.connect(&mesh, &a)?;
    let snapshot = a
        .wait_until("inbound session", |s| s.session_count() == 1)
        .await?;
    let id = snapshot
        .session_for_address(&c.addrs.address)
        .context("no session for the peer address")?;
    assert_eq!(snapshot.session_for_subnet(&c.addrs.subnet), Some(id));
    Ok(())
}

/// A second connection from the same identity replaces the first, which is
/// closed.
#[tokio::test]
async fn test_collision_replaces_and_closes_old_session() -> Result<()> {
    let mesh = MemoryMesh::new();
    let mut a = start_node(&mesh)?;
    let c = raw_peer(&mesh, 3);

    let first = c.connect(&mesh, &a)?;
    let before = a
        .wait_until("first session", |s| s.session_count() == 1)
        .await?;
    let old_id = before
        .session_for_address(&c.addrs.address)
        .context("no first session")?;

    let second = c.connect(&mesh, &a)?;
    let after = a
        .wait_until("replacement session", |s| {
            s.session_for_address(&c.addrs.address)
                .is_some_and(|id| id != old_id)
        })
        .await?;
    assert_eq!(after.session_count(), 1);
    eventually("old connection closed", || first.is_closed()).await?;
    assert!(!second.is_closed());

    // Traffic flows over the replacement.
    let packet = c.packet_to(a.addrs.address.0, b"over the new one");
    second.send(packet.clone())?;
    assert_eq!(a.recv().await?, Bytes::from(packet));
    Ok(())
}

/// A dial that resolves while an inbound session already exists replaces
/// it and still flushes the held packets.
#[tokio::test]
async fn test_dial_resolving_after_inbound_session_flushes_buffer() -> Result<()> {
    let mesh = MemoryMesh::new();
    let a = start_node(&mesh)?;
    let c = raw_peer(&mesh, 6);
    mesh.hold_dials();

    let held = a.packet_to(c.addrs.address.0, b"held");
    a.send(&held).await?;
    eventually("dial started", || mesh.dials_started() == 1).await?;

    let inbound = c.connect(&mesh, &a)?;
    a.wait_until("inbound session", |s| s.session_count() == 1)
        .await?;

    mesh.release_dials();
    let dialed = c.accept().await?;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    dialed.set_receive_callback(Box::new(move |p| {
        let _ = tx.send(p);
    }));
    let got = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .context("timed out waiting for the held packet")?
        .context("dialed connection dropped")?;
    assert_eq!(got, Bytes::from(held));
    eventually("inbound session closed", || inbound.is_closed()).await
}

/// Oversized writes are lost but the session keeps working.
#[tokio::test]
async fn test_packet_too_big_is_dropped_and_session_survives() -> Result<()> {
    let mesh = MemoryMesh::new();
    let a = start_node(&mesh)?;
    let c = raw_peer(&mesh, 3);

    let conn = c.connect(&mesh, &a)?;
    let mut rx = conn.subscribe();
    a.wait_until("inbound session", |s| s.session_count() == 1)
        .await?;
    mesh.set_mtu(1280);

    a.send(&a.packet_to(c.addrs.address.0, &[0u8; 2000])).await?;
    let small = a.packet_to(c.addrs.address.0, b"small");
    a.send(&small).await?;

    let got = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .context("timed out waiting for the small packet")?
        .context("connection dropped")?;
    assert_eq!(got, Bytes::from(small));
    let snapshot = a.adapter.snapshot().await?;
    assert_eq!(snapshot.session_count(), 1);
    assert!(!conn.is_closed());
    Ok(())
}

/// A connection closed underneath a session takes the session down on the
/// next write.
#[tokio::test]
async fn test_closed_connection_removes_session() -> Result<()> {
    let mesh = MemoryMesh::new();
    let a = start_node(&mesh)?;
    let c = raw_peer(&mesh, 3);

    let conn = c.connect(&mesh, &a)?;
    a.wait_until("inbound session", |s| s.session_count() == 1)
        .await?;
    conn.close();

    a.send(&a.packet_to(c.addrs.address.0, b"into the void"))
        .await?;
    a.wait_until("session removed", |s| s.session_count() == 0)
        .await?;
    Ok(())
}

/// Stopping closes the conduit and every session.
#[tokio::test]
async fn test_stop_closes_conduit_and_sessions() -> Result<()> {
    let mesh = MemoryMesh::new();
    let mut a = start_node(&mesh)?;
    let c = raw_peer(&mesh, 3);
    let d = raw_peer(&mesh, 4);

    let to_c = c.connect(&mesh, &a)?;
    let to_d = d.connect(&mesh, &a)?;
    a.wait_until("two sessions", |s| s.session_count() == 2)
        .await?;

    a.adapter.stop().await?;
    assert!(!a.adapter.is_running());
    eventually("sessions closed", || to_c.is_closed() && to_d.is_closed()).await?;
    assert!(a.endpoint.recv().await.is_err());
    assert!(a.endpoint.send(b"late").await.is_err());

    // Stopping again is harmless.
    a.adapter.stop().await?;
    Ok(())
}
