//! Integration tests for the sync client
//!
//! Runs the connection manager and sync session against a scripted
//! WebSocket server: handshake, snapshot/patch flow, reconnection and backoff.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use common::{eventually, patch_message, unused_ws_url, within, MockSyncServer};
use syncdeck::connection::{
    ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState, EventKind, StatusUpdate,
};
use syncdeck::sync::{DisplayKind, SessionConfig, SyncSession};

const WAIT: Duration = Duration::from_secs(5);

fn fast_reconnect() -> ConnectionConfig {
    ConnectionConfig {
        connect_timeout: Duration::from_secs(2),
        initial_reconnect_delay: Duration::from_millis(50),
        max_reconnect_delay: Duration::from_millis(200),
        ..Default::default()
    }
}

fn record_statuses(manager: &ConnectionManager) -> (Arc<Mutex<Vec<StatusUpdate>>>, syncdeck::connection::Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let subscription = manager.on(EventKind::Status, move |event| {
        if let ConnectionEvent::Status(update) = event {
            sink.lock().push(*update);
        }
    });
    (seen, subscription)
}

fn reconnect_delays(seen: &Mutex<Vec<StatusUpdate>>) -> Vec<Option<u64>> {
    seen.lock()
        .iter()
        .filter(|u| u.state == ConnectionState::Reconnecting)
        .map(|u| u.delay_ms)
        .collect()
}

// ─────────────────────────────────────────────────────────────────
// Handshake and State Flow
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_handshake_then_snapshot() {
    let server = MockSyncServer::start_with_snapshot(3, json!({"rows": []})).await;
    let session = SyncSession::new(fast_reconnect(), SessionConfig::default());

    session.start(&server.ws_url()).unwrap();
    assert!(eventually(WAIT, || session.version() == 3).await);

    assert_eq!(server.received_types(), vec!["hello", "subscribe"]);
    let hello = &server.received()[0];
    assert_eq!(hello["payload"]["capabilities"], json!(["state.patch", "logs"]));
    assert_eq!(server.received()[1]["payload"]["includeSnapshot"], json!(true));

    assert_eq!(session.document(), Some(json!({"rows": []})));
    assert_eq!(session.status().kind, DisplayKind::Connected);

    session.shutdown().await;
}

#[tokio::test]
async fn test_patches_apply_in_order() {
    let server = MockSyncServer::start_with_snapshot(3, json!({"rows": [], "title": "old"})).await;
    let session = SyncSession::new(fast_reconnect(), SessionConfig::default());
    session.start(&server.ws_url()).unwrap();
    assert!(eventually(WAIT, || session.version() == 3).await);

    server.send(patch_message(
        3,
        4,
        json!([{"op": "add", "path": "/rows/-", "value": {"id": 1}}]),
    ));
    server.send(patch_message(
        4,
        5,
        json!([{"op": "replace", "path": ["title"], "value": "new"}]),
    ));

    assert!(eventually(WAIT, || session.version() == 5).await);
    assert_eq!(
        session.document(),
        Some(json!({"rows": [{"id": 1}], "title": "new"}))
    );

    session.shutdown().await;
}

#[tokio::test]
async fn test_version_gap_requests_snapshot() {
    let server = MockSyncServer::start_with_snapshot(3, json!({"n": 3})).await;
    let session = SyncSession::new(fast_reconnect(), SessionConfig::default());
    session.start(&server.ws_url()).unwrap();
    assert!(eventually(WAIT, || session.version() == 3).await);

    // The server moved on; the next subscribe gets the fresh snapshot
    server.set_snapshot(11, json!({"n": 11}));
    server.send(patch_message(10, 11, json!([{"op": "replace", "path": "/n", "value": 11}])));

    assert!(eventually(WAIT, || session.version() == 11).await);
    assert_eq!(session.document(), Some(json!({"n": 11})));
    assert_eq!(
        server.received_types(),
        vec!["hello", "subscribe", "subscribe"]
    );

    session.shutdown().await;
}

#[tokio::test]
async fn test_stale_patch_leaves_mirror_untouched() {
    let server = MockSyncServer::start_with_snapshot(5, json!({"n": 5})).await;
    let session = SyncSession::new(fast_reconnect(), SessionConfig::default());
    session.start(&server.ws_url()).unwrap();
    assert!(eventually(WAIT, || session.version() == 5).await);

    server.send(patch_message(4, 5, json!([{"op": "replace", "path": "/n", "value": 0}])));
    server.send_raw("{not json");
    server.send(patch_message(5, 6, json!([{"op": "replace", "path": "/n", "value": 6}])));

    assert!(eventually(WAIT, || session.version() == 6).await);
    assert_eq!(session.document(), Some(json!({"n": 6})));
    // Stale patches never trigger a resync
    assert_eq!(server.received_types(), vec!["hello", "subscribe"]);

    session.shutdown().await;
}

#[tokio::test]
async fn test_log_history_and_append() {
    let server = MockSyncServer::start().await;
    let session = SyncSession::new(fast_reconnect(), SessionConfig::default());
    session.start(&server.ws_url()).unwrap();
    assert!(eventually(WAIT, || session.version() == 1).await);

    server.send(json!({"type": "logs.history", "entries": ["a", "b"]}));
    server.send(json!({"type": "logs.append", "entries": []}));
    server.send(json!({"type": "logs.append", "entries": ["c"]}));

    assert!(eventually(WAIT, || session.logs().len() == 3).await);
    assert_eq!(session.logs(), vec![json!("a"), json!("b"), json!("c")]);

    session.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────
// Reconnection
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_reconnect_repeats_handshake() {
    let server = MockSyncServer::start_with_snapshot(2, json!({"v": 2})).await;
    let session = SyncSession::new(fast_reconnect(), SessionConfig::default());
    session.start(&server.ws_url()).unwrap();
    assert!(eventually(WAIT, || session.version() == 2).await);

    server.set_snapshot(7, json!({"v": 7}));
    server.drop_connections();

    assert!(eventually(WAIT, || session.version() == 7).await);
    assert_eq!(server.connection_count(), 2);
    assert_eq!(
        server.received_types(),
        vec!["hello", "subscribe", "hello", "subscribe"]
    );
    assert_eq!(session.status().kind, DisplayKind::Connected);

    session.shutdown().await;
}

#[tokio::test]
async fn test_backoff_resets_after_successful_open() {
    let server = MockSyncServer::start().await;
    let manager = ConnectionManager::new(fast_reconnect());
    let (seen, _subscription) = record_statuses(&manager);

    manager.connect(&server.ws_url()).unwrap();
    assert!(eventually(WAIT, || manager.is_open()).await);

    server.drop_connections();
    assert!(eventually(WAIT, || server.connection_count() == 2 && manager.is_open()).await);

    server.drop_connections();
    assert!(eventually(WAIT, || server.connection_count() == 3 && manager.is_open()).await);

    // Each outage starts from the initial delay again
    assert_eq!(reconnect_delays(&seen), vec![Some(50), Some(50)]);
    assert_eq!(manager.attempts(), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_backoff_grows_to_cap_then_gives_up() {
    let url = unused_ws_url().await;
    let manager = ConnectionManager::new(ConnectionConfig {
        connect_timeout: Duration::from_secs(2),
        max_reconnect_attempts: 5,
        initial_reconnect_delay: Duration::from_millis(10),
        max_reconnect_delay: Duration::from_millis(25),
        multiplier: 2.0,
        ..Default::default()
    });
    let (seen, _subscription) = record_statuses(&manager);

    manager.connect(&url).unwrap();
    assert!(eventually(WAIT, || manager.state() == ConnectionState::Closed).await);

    assert_eq!(manager.attempts(), 5);
    assert_eq!(
        reconnect_delays(&seen),
        vec![Some(10), Some(20), Some(25), Some(25)]
    );
    let last = *seen.lock().last().unwrap();
    assert_eq!(last.state, ConnectionState::Closed);
    assert_eq!(last.attempts, 5);
}

#[tokio::test]
async fn test_connect_while_live_is_noop() {
    let server = MockSyncServer::start().await;
    let manager = ConnectionManager::new(fast_reconnect());

    manager.connect(&server.ws_url()).unwrap();
    manager.connect(&server.ws_url()).unwrap();
    assert!(eventually(WAIT, || manager.is_open()).await);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.connection_count(), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_stop_prevents_reconnect() {
    let server = MockSyncServer::start().await;
    let session = SyncSession::new(fast_reconnect(), SessionConfig::default());
    session.start(&server.ws_url()).unwrap();
    assert!(eventually(WAIT, || session.version() == 1).await);

    within(WAIT, session.shutdown()).await;
    assert_eq!(session.connection().state(), ConnectionState::Closed);
    assert_eq!(session.status().kind, DisplayKind::Disconnected);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.connection_count(), 1);

    // A stopped session can be started again
    session.start(&server.ws_url()).unwrap();
    assert!(eventually(WAIT, || server.connection_count() == 2).await);
    session.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_never_overlaps_handler_delivery() {
    let server = MockSyncServer::start().await;
    let manager = ConnectionManager::new(fast_reconnect());

    let inside = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut subscriptions = Vec::new();
    for kind in [EventKind::Open, EventKind::Close, EventKind::Error, EventKind::Status] {
        let inside = inside.clone();
        let overlaps = overlaps.clone();
        let seen = seen.clone();
        subscriptions.push(manager.on(kind, move |event| {
            if inside.swap(true, Ordering::SeqCst) {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            seen.lock().push(event.kind());
            // Widen the window a second loop would need to interleave
            std::thread::sleep(Duration::from_millis(2));
            inside.store(false, Ordering::SeqCst);
        }));
    }

    manager.connect(&server.ws_url()).unwrap();
    assert!(eventually(WAIT, || manager.is_open()).await);

    for _ in 0..10 {
        manager.stop();
        manager.connect(&server.ws_url()).unwrap();
    }
    assert!(eventually(WAIT, || manager.is_open()).await);
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    // Nothing from a superseded loop arrives after the live one opened
    assert_eq!(seen.lock().last().copied(), Some(EventKind::Open));

    for subscription in subscriptions {
        subscription.dispose();
    }
    manager.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────
// Handler Disposal
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_disposing_one_handler_keeps_the_others() {
    let server = MockSyncServer::start().await;
    let manager = ConnectionManager::new(fast_reconnect());

    let first = Arc::new(Mutex::new(0));
    let second = Arc::new(Mutex::new(0));
    let counter = first.clone();
    let first_sub = manager.on(EventKind::Message, move |_| *counter.lock() += 1);
    let counter = second.clone();
    let _second_sub = manager.on(EventKind::Message, move |_| *counter.lock() += 1);

    manager.connect(&server.ws_url()).unwrap();
    assert!(eventually(WAIT, || manager.is_open()).await);

    first_sub.dispose();
    first_sub.dispose();
    assert_eq!(manager.registered(EventKind::Message), 1);

    server.send(json!({"type": "logs.append", "entries": ["x"]}));
    assert!(eventually(WAIT, || *second.lock() == 1).await);
    assert_eq!(*first.lock(), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_disposed_session_stops_applying_state() {
    let server = MockSyncServer::start_with_snapshot(1, json!({})).await;
    let session = SyncSession::new(fast_reconnect(), SessionConfig::default());

    let messages = Arc::new(Mutex::new(0));
    let counter = messages.clone();
    let _observer = session
        .connection()
        .on(EventKind::Message, move |_| *counter.lock() += 1);

    session.start(&server.ws_url()).unwrap();
    assert!(eventually(WAIT, || session.version() == 1).await);

    session.dispose();
    session.dispose();

    server.send(patch_message(1, 2, json!([{"op": "add", "path": "/k", "value": true}])));
    assert!(eventually(WAIT, || *messages.lock() == 2).await);
    assert_eq!(session.version(), 1);

    session.shutdown().await;
}
