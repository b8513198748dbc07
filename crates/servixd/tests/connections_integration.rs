//! Integration tests for the connection manager: grace-period expiry,
//! transfer atomicity and channel fan-out.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::time::Duration;

use serde_json::json;
use servix_core::{ConnectionId, ConnectionState};
use servix_protocol::ServerMessage;
use servixd::connections::{spawn_connections, ConnectionEvent, ConnectionsHandle};
use servixd::transfer::TransferError;
use tokio::sync::mpsc;

const GRACE: Duration = Duration::from_secs(60);

async fn connected(
    handle: &ConnectionsHandle,
    label: &str,
) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
    let (tx, rx) = mpsc::channel(16);
    let id = handle.create(label, Some(tx)).await.unwrap();
    (id, rx)
}

// ============================================================================
// Grace period
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_session_expires_after_grace_period() {
    let handle = spawn_connections(GRACE);
    let mut events = handle.subscribe();
    let (id, _rx) = connected(&handle, "a").await;
    handle.set_data(&id, "user", json!("ada")).await.unwrap();

    handle.disconnect(&id).await.unwrap();
    let snapshot = handle.get(&id).await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::GracePeriod);
    assert_eq!(snapshot.data.get("user"), Some(&json!("ada")));

    tokio::time::sleep(GRACE - Duration::from_secs(1)).await;
    assert!(handle.get(&id).await.is_some());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(handle.get(&id).await.is_none());
    assert_eq!(handle.count().await, 0);

    let mut expired = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ConnectionEvent::Expired { id: ref e } if e == &id) {
            expired = true;
        }
    }
    assert!(expired, "Expired event published");
}

#[tokio::test(start_paused = true)]
async fn test_repeated_disconnect_arms_one_timer() {
    let handle = spawn_connections(GRACE);
    let (id, _rx) = connected(&handle, "a").await;

    handle.disconnect(&id).await.unwrap();
    tokio::time::sleep(GRACE / 2).await;
    // Already in grace: must not push the deadline back.
    handle.disconnect(&id).await.unwrap();

    tokio::time::sleep(GRACE / 2 + Duration::from_secs(1)).await;
    assert!(handle.get(&id).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_transfer_cancels_expiry() {
    let handle = spawn_connections(GRACE);
    let (old, _old_rx) = connected(&handle, "old").await;
    handle.set_data(&old, "user", json!({"id": 7})).await.unwrap();
    handle.join("room", &old).await.unwrap();
    handle.disconnect(&old).await.unwrap();

    tokio::time::sleep(GRACE / 2).await;
    let (new, _new_rx) = connected(&handle, "new").await;
    handle.transfer(&old, &new).await.unwrap();

    tokio::time::sleep(GRACE * 2).await;
    let snapshot = handle.get(&new).await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Connected);
    assert_eq!(snapshot.data.get("user"), Some(&json!({"id": 7})));
    assert_eq!(handle.members("room").await, vec![new]);
    assert!(handle.get(&old).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_removed_connection_timer_is_ignored() {
    let handle = spawn_connections(GRACE);
    let (id, _rx) = connected(&handle, "a").await;
    handle.disconnect(&id).await.unwrap();
    handle.remove(&id).await.unwrap();
    handle.remove(&id).await.unwrap();

    let (other, _other_rx) = connected(&handle, "b").await;
    tokio::time::sleep(GRACE * 2).await;
    assert!(handle.get(&other).await.is_some());
}

// ============================================================================
// Transfer atomicity
// ============================================================================

#[tokio::test]
async fn test_concurrent_transfers_succeed_at_most_once() {
    for _ in 0..20 {
        let handle = spawn_connections(GRACE);
        let (old, _old_rx) = connected(&handle, "old").await;
        handle.set_data(&old, "k", json!(1)).await.unwrap();
        handle.disconnect(&old).await.unwrap();

        let (b, _b_rx) = connected(&handle, "b").await;
        let (c, _c_rx) = connected(&handle, "c").await;

        let (hb, hc) = (handle.clone(), handle.clone());
        let (ob, oc) = (old.clone(), old.clone());
        let (tb, tc) = (b.clone(), c.clone());
        let first = tokio::spawn(async move { hb.transfer(&ob, &tb).await });
        let second = tokio::spawn(async move { hc.transfer(&oc, &tc).await });
        let results = [first.await.unwrap(), second.await.unwrap()];

        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1, "results: {results:?}");
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(TransferError::UnknownSource(_)))));

        let mut with_data = 0;
        for id in [&b, &c] {
            if handle.get_data(id, "k").await.unwrap() == Some(json!(1)) {
                with_data += 1;
            }
        }
        assert_eq!(with_data, 1);
        assert!(handle.get(&old).await.is_none());
    }
}

#[tokio::test]
async fn test_transfer_validation() {
    let handle = spawn_connections(GRACE);
    let (a, _a_rx) = connected(&handle, "a").await;
    let (b, _b_rx) = connected(&handle, "b").await;

    assert!(matches!(
        handle.transfer(&a, &a).await,
        Err(TransferError::SameConnection(_))
    ));
    assert!(matches!(
        handle.transfer(&ConnectionId::new("cnx-404"), &b).await,
        Err(TransferError::UnknownSource(_))
    ));

    handle.disconnect(&b).await.unwrap();
    assert!(matches!(
        handle.transfer(&a, &b).await,
        Err(TransferError::TargetNotConnected(_))
    ));
    // Nothing moved.
    assert!(handle.get(&a).await.is_some());
}

// ============================================================================
// Broadcast
// ============================================================================

#[tokio::test]
async fn test_broadcast_delivers_once_per_connection() {
    let handle = spawn_connections(GRACE);
    let (a, mut a_rx) = connected(&handle, "a").await;
    let (b, mut b_rx) = connected(&handle, "b").await;
    let (idle, _idle_rx) = connected(&handle, "idle").await;

    for channel in ["x", "y"] {
        handle.join(channel, &a).await.unwrap();
    }
    handle.join("y", &b).await.unwrap();
    handle.join("x", &idle).await.unwrap();
    handle.disconnect(&idle).await.unwrap();

    let delivered = handle
        .broadcast(
            vec!["x".into(), "y".into()],
            ServerMessage::service_event("User", "create", json!({"uid": "u1"})),
        )
        .await;
    assert_eq!(delivered, 2);

    assert!(matches!(a_rx.try_recv(), Ok(ServerMessage::ServiceEvent { .. })));
    assert!(a_rx.try_recv().is_err());
    assert!(matches!(b_rx.try_recv(), Ok(ServerMessage::ServiceEvent { .. })));
    assert!(b_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_membership_is_idempotent() {
    let handle = spawn_connections(GRACE);
    let (a, _rx) = connected(&handle, "a").await;

    assert!(handle.join("x", &a).await.unwrap());
    assert!(!handle.join("x", &a).await.unwrap());
    assert!(!handle.leave("y", &a).await.unwrap());
    assert!(handle.leave("x", &a).await.unwrap());
    assert!(handle.members("x").await.is_empty());
}
