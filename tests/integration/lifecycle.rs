use crate::*;

/// A session with no traffic for the idle timeout is removed and its
/// connection closed exactly once.
#[tokio::test(start_paused = true)]
async fn test_idle_session_is_removed() -> Result<()> {
    let mesh = MemoryMesh::new();
    let a = start_node(&mesh)?;
    let c = raw_peer(&mesh, 3);

    let conn = c.connect(&mesh, &a)?;
    a.wait_until("inbound session", |s| s.session_count() == 1)
        .await?;

    tokio::time::sleep(SESSION_IDLE_TIMEOUT + Duration::from_secs(1)).await;
    a.wait_until("idle removal", |s| s.session_count() == 0)
        .await?;
    eventually("connection closed", || conn.is_closed()).await?;
    assert_eq!(mesh.closes(), 1);
    Ok(())
}

/// Successful reads push the deadline out.
#[tokio::test(start_paused = true)]
async fn test_traffic_keeps_session_alive() -> Result<()> {
    let mesh = MemoryMesh::new();
    let mut a = start_node(&mesh)?;
    let c = raw_peer(&mesh, 3);

    let conn = c.connect(&mesh, &a)?;
    a.wait_until("inbound session", |s| s.session_count() == 1)
        .await?;

    tokio::time::sleep(Duration::from_secs(100)).await;
    conn.send(c.packet_to(a.addrs.address.0, b"still here"))?;
    a.recv().await?;

    tokio::time::sleep(Duration::from_secs(100)).await;
    let snapshot = a.adapter.snapshot().await?;
    assert_eq!(snapshot.session_count(), 1, "session expired despite traffic");
    assert!(!conn.is_closed());

    tokio::time::sleep(Duration::from_secs(25)).await;
    a.wait_until("idle removal", |s| s.session_count() == 0)
        .await?;
    Ok(())
}

/// Packets that fail validation do not count as activity.
#[tokio::test(start_paused = true)]
async fn test_rejected_packets_do_not_reset_idle_timer() -> Result<()> {
    let mesh = MemoryMesh::new();
    let a = start_node(&mesh)?;
    let c = raw_peer(&mesh, 3);
    let stranger = NodeAddrs::for_key(&[8u8; 32]);

    let conn = c.connect(&mesh, &a)?;
    a.wait_until("inbound session", |s| s.session_count() == 1)
        .await?;

    tokio::time::sleep(Duration::from_secs(100)).await;
    conn.send(build_ipv6(stranger.address.0, a.addrs.address.0, b"spoof"))?;

    tokio::time::sleep(Duration::from_secs(25)).await;
    a.wait_until("idle removal", |s| s.session_count() == 0)
        .await?;
    Ok(())
}

/// After an idle close, new traffic dials again and gets through.
#[tokio::test(start_paused = true)]
async fn test_traffic_after_idle_close_dials_again() -> Result<()> {
    let mesh = MemoryMesh::new();
    let a = start_node(&mesh)?;
    let mut b = start_node(&mesh)?;

    a.send(&a.packet_to(b.addrs.address.0, b"first")).await?;
    b.recv().await?;
    assert_eq!(mesh.dials_started(), 1);

    tokio::time::sleep(SESSION_IDLE_TIMEOUT + Duration::from_secs(1)).await;
    a.wait_until("idle removal on a", |s| s.session_count() == 0)
        .await?;
    b.wait_until("idle removal on b", |s| s.session_count() == 0)
        .await?;

    let again = a.packet_to(b.addrs.address.0, b"second");
    a.send(&again).await?;
    assert_eq!(b.recv().await?, Bytes::from(again));
    assert_eq!(mesh.dials_started(), 2);
    Ok(())
}

/// A shortened idle timeout is honoured.
#[tokio::test(start_paused = true)]
async fn test_custom_idle_timeout() -> Result<()> {
    let mesh = MemoryMesh::new();
    let a = start_node_with_idle(&mesh, Duration::from_secs(5))?;
    let c = raw_peer(&mesh, 3);

    let _conn = c.connect(&mesh, &a)?;
    a.wait_until("inbound session", |s| s.session_count() == 1)
        .await?;
    tokio::time::sleep(Duration::from_secs(6)).await;
    a.wait_until("idle removal", |s| s.session_count() == 0)
        .await?;
    Ok(())
}
