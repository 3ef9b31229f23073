//! Disconnect recovery tests
//!
//! After any disconnect the broker may keep the reconnected session alive
//! while silently no longer delivering config notifications. The manager
//! therefore rebuilds the whole session (with a fresh token) on the first
//! successful connect after a disconnect. These tests drive that protocol
//! through mock sessions.

use iotcore_bridge::manager::{ConnectionManager, ConnectionState, ManagerSettings};
use iotcore_bridge::testing::{test_credential, test_identity, MockSessionFactory};
use iotcore_bridge::{EventSink, ResultCode, SessionEvent};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Counters {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

fn build_manager() -> (
    ConnectionManager<MockSessionFactory>,
    MockSessionFactory,
    Arc<Counters>,
) {
    let counters = Arc::new(Counters::default());
    let (c, d) = (counters.clone(), counters.clone());
    let sink = EventSink::new()
        .with_on_connect(move || {
            c.connects.fetch_add(1, Ordering::SeqCst);
        })
        .with_on_disconnect(move || {
            d.disconnects.fetch_add(1, Ordering::SeqCst);
        });

    let factory = MockSessionFactory::new();
    let settings = ManagerSettings::new(test_identity(), test_credential()).with_sink(sink);
    let manager = ConnectionManager::new(settings, factory.clone()).unwrap();
    (manager, factory, counters)
}

fn live_event(manager: &ConnectionManager<MockSessionFactory>, event: SessionEvent) {
    let id = manager.current_session().expect("no live session");
    manager.handle_session_event(id, event);
}

#[test]
fn test_first_connect_notifies_once_without_rebuild() {
    // Arrange
    let (manager, factory, counters) = build_manager();
    manager.connect().unwrap();

    // Act
    live_event(&manager, SessionEvent::Connected(ResultCode::SUCCESS));

    // Assert
    assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
    assert_eq!(factory.session_count(), 1, "no rebuild expected");
    assert_eq!(factory.session(0).stops, 0);
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(!manager.disconnect_pending());
}

#[test]
fn test_disconnect_event_sets_pending_and_notifies() {
    let (manager, _factory, counters) = build_manager();
    manager.connect().unwrap();
    live_event(&manager, SessionEvent::Connected(ResultCode::SUCCESS));

    live_event(&manager, SessionEvent::Disconnected(ResultCode::CONNECTION_LOST));

    assert!(manager.disconnect_pending());
    assert_eq!(counters.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(manager.state(), ConnectionState::Connecting);
}

// A plain transport reconnect is not enough after a disconnect: the session
// object itself must be replaced for config notifications to resume
#[test]
fn test_reconnect_after_disconnect_rebuilds_session() {
    // Arrange
    let (manager, factory, counters) = build_manager();
    manager.connect().unwrap();
    live_event(&manager, SessionEvent::Connected(ResultCode::SUCCESS));
    live_event(&manager, SessionEvent::Disconnected(ResultCode::CONNECTION_LOST));
    let before = manager.current_session().unwrap();
    assert!(manager.disconnect_pending());

    // Act: the old session's transport reconnects on its own
    live_event(&manager, SessionEvent::Connected(ResultCode::SUCCESS));

    // Assert
    let after = manager.current_session().unwrap();
    assert_ne!(before, after, "session must be a new object");
    assert!(!manager.disconnect_pending());
    assert_eq!(factory.session_count(), 2);

    let old = factory.session(0);
    let new = factory.session(1);
    assert_eq!(old.stops, 1, "old session must be stopped");
    assert_eq!(new.starts.len(), 1, "exactly one new connect cycle");
    assert_eq!(new.session_id, after);
    assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
    assert_eq!(manager.state(), ConnectionState::Connecting);
}

#[test]
fn test_rebuilt_session_connect_does_not_rebuild_again() {
    let (manager, factory, counters) = build_manager();
    manager.connect().unwrap();
    live_event(&manager, SessionEvent::Connected(ResultCode::SUCCESS));
    live_event(&manager, SessionEvent::Disconnected(ResultCode::CONNECTION_LOST));
    live_event(&manager, SessionEvent::Connected(ResultCode::SUCCESS));

    // The replacement session's own connect
    live_event(&manager, SessionEvent::Connected(ResultCode::SUCCESS));

    assert_eq!(factory.session_count(), 2);
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(counters.connects.load(Ordering::SeqCst), 3);
}

#[test]
fn test_rebuild_issues_fresh_token() {
    let (manager, factory, _counters) = build_manager();
    manager.connect().unwrap();
    live_event(&manager, SessionEvent::Disconnected(ResultCode::CONNECTION_LOST));
    live_event(&manager, SessionEvent::Connected(ResultCode::SUCCESS));

    let first = factory.session(0).token;
    let second = factory.session(1).token;
    assert!(second.issued_at() >= first.issued_at());
    assert_eq!(second.audience(), "test-project");
    assert_eq!(manager.token_expires_at(), Some(second.expires_at()));
}

#[test]
fn test_failed_connect_does_not_notify_or_touch_pending() {
    let (manager, factory, counters) = build_manager();
    manager.connect().unwrap();

    live_event(&manager, SessionEvent::Connected(ResultCode::BAD_CREDENTIALS));
    assert_eq!(counters.connects.load(Ordering::SeqCst), 0);
    assert!(!manager.disconnect_pending());

    live_event(&manager, SessionEvent::Disconnected(ResultCode::CONNECTION_LOST));
    live_event(&manager, SessionEvent::Connected(ResultCode::SERVER_UNAVAILABLE));
    assert_eq!(counters.connects.load(Ordering::SeqCst), 0);
    assert!(manager.disconnect_pending(), "failed connect must not clear the flag");
    assert_eq!(factory.session_count(), 1, "failed connect must not rebuild");
}

#[test]
fn test_disconnect_keeps_pending_flag_across_reconnect() {
    let (manager, factory, _counters) = build_manager();
    manager.connect().unwrap();
    live_event(&manager, SessionEvent::Disconnected(ResultCode::CONNECTION_LOST));

    manager.disconnect();
    assert!(manager.disconnect_pending());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(factory.session(0).stops, 1);

    // A fresh connect still rebuilds on its first successful connect
    manager.connect().unwrap();
    live_event(&manager, SessionEvent::Connected(ResultCode::SUCCESS));
    assert_eq!(factory.session_count(), 3);
    assert!(!manager.disconnect_pending());
}

#[test]
fn test_disconnect_when_idle_is_idempotent() {
    let (manager, factory, counters) = build_manager();

    manager.disconnect();
    manager.disconnect();

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(factory.session_count(), 0);
    assert_eq!(counters.disconnects.load(Ordering::SeqCst), 0);
}

#[test]
fn test_events_from_replaced_session_are_ignored() {
    let (manager, factory, counters) = build_manager();
    manager.connect().unwrap();
    let old = manager.current_session().unwrap();
    live_event(&manager, SessionEvent::Disconnected(ResultCode::CONNECTION_LOST));
    live_event(&manager, SessionEvent::Connected(ResultCode::SUCCESS));

    // Late event from the stopped session
    manager.handle_session_event(old, SessionEvent::Disconnected(ResultCode::CONNECTION_LOST));

    assert!(!manager.disconnect_pending());
    assert_eq!(counters.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(factory.session_count(), 2);
}

#[tokio::test]
async fn test_events_flow_through_dispatcher() {
    // Arrange
    let (manager, factory, counters) = build_manager();
    let mut state_rx = manager.watch_state();
    manager.connect().unwrap();

    // Act: events go through the real channel and dispatcher task
    factory.session(0).emit_connected(ResultCode::SUCCESS);

    // Assert
    tokio::time::timeout(Duration::from_secs(5), async {
        while *state_rx.borrow_and_update() != ConnectionState::Connected {
            state_rx.changed().await.unwrap();
        }
    })
    .await
    .expect("manager never reached Connected");
    assert_eq!(counters.connects.load(Ordering::SeqCst), 1);

    factory.session(0).emit_disconnected(ResultCode::CONNECTION_LOST);
    factory.session(0).emit_connected(ResultCode::SUCCESS);

    tokio::time::timeout(Duration::from_secs(5), async {
        while factory.session_count() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session was never rebuilt");
    assert_eq!(factory.session(0).stops, 1);
}

#[test]
fn test_failed_rebuild_keeps_pending_and_does_not_notify() {
    // Arrange
    let (manager, factory, counters) = build_manager();
    manager.connect().unwrap();
    live_event(&manager, SessionEvent::Connected(ResultCode::SUCCESS));
    live_event(&manager, SessionEvent::Disconnected(ResultCode::CONNECTION_LOST));
    factory.fail_next_build();

    // Act
    live_event(&manager, SessionEvent::Connected(ResultCode::SUCCESS));

    // Assert
    assert_eq!(counters.connects.load(Ordering::SeqCst), 1, "no on_connect without a session");
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.disconnect_pending(), "rebuild never started");
    assert_eq!(manager.current_session(), None);
    assert_eq!(factory.session(0).stops, 1);

    // The next connect still owes a rebuild
    manager.connect().unwrap();
    live_event(&manager, SessionEvent::Connected(ResultCode::SUCCESS));
    assert_eq!(factory.session_count(), 3);
    assert!(!manager.disconnect_pending());
    assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
}
