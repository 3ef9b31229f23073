//! Mock transport sessions for testing
//!
//! [`MockSessionFactory`] records every session the manager builds: its
//! parameters, start/stop calls and publishes. Events are injected through
//! the session's real [`EventEmitter`], so they travel the same queue as
//! events from a rumqttc session.

use crate::auth::{AuthToken, Credential};
use crate::error::{BridgeError, BridgeResult};
use crate::identity::DeviceIdentity;
use crate::transport::{
    EventEmitter, ResultCode, SessionEvent, SessionFactory, SessionId, SessionParams,
    TransportSession,
};
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TEST_PRIVATE_KEY: &[u8] = include_bytes!("../../tests/fixtures/device_rsa_private.pem");
const TEST_CA_BUNDLE: &[u8] = include_bytes!("../../tests/fixtures/ca_bundle.pem");

pub type PublishedMessage = (String, Vec<u8>, QoS);

/// Identity used across tests
pub fn test_identity() -> DeviceIdentity {
    DeviceIdentity::new("test-project", "us-central1", "test-registry", "test-device")
}

/// Credential built from the bundled test fixtures
pub fn test_credential() -> Credential {
    match Credential::from_pem(TEST_PRIVATE_KEY, TEST_CA_BUNDLE.to_vec()) {
        Ok(credential) => credential,
        Err(e) => panic!("test fixtures are invalid: {e}"),
    }
}

/// What one mock session saw
#[derive(Debug, Clone)]
pub struct MockSessionRecord {
    pub session_id: SessionId,
    pub client_id: String,
    pub username: String,
    pub token: AuthToken,
    pub ca_bundle: Vec<u8>,
    pub subscriptions: Vec<String>,
    pub starts: Vec<(String, u16, Duration)>,
    pub stops: usize,
    pub published: Vec<PublishedMessage>,
    emitter: EventEmitter,
}

impl MockSessionRecord {
    /// Inject an event as if this session had produced it
    pub fn emit(&self, event: SessionEvent) {
        self.emitter.emit(event);
    }

    pub fn emit_connected(&self, code: ResultCode) {
        self.emit(SessionEvent::Connected(code));
    }

    pub fn emit_disconnected(&self, code: ResultCode) {
        self.emit(SessionEvent::Disconnected(code));
    }

    pub fn emit_message(&self, topic: &str, payload: &[u8]) {
        self.emit(SessionEvent::Message {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
        });
    }

    /// True once started and not yet stopped
    pub fn is_running(&self) -> bool {
        !self.starts.is_empty() && self.stops == 0
    }
}

/// Factory that records every session it builds
///
/// Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MockSessionFactory {
    records: Arc<Mutex<Vec<MockSessionRecord>>>,
    fail_next: Arc<AtomicBool>,
}

impl MockSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `new_session` call fail
    pub fn fail_next_build(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn session_count(&self) -> usize {
        self.records.lock().len()
    }

    /// Snapshot of the `index`th session built
    pub fn session(&self, index: usize) -> MockSessionRecord {
        match self.records.lock().get(index) {
            Some(record) => record.clone(),
            None => panic!("no mock session at index {index}"),
        }
    }

    pub fn sessions(&self) -> Vec<MockSessionRecord> {
        self.records.lock().clone()
    }

    /// Snapshot of the most recently built session
    pub fn last_session(&self) -> MockSessionRecord {
        match self.records.lock().last() {
            Some(record) => record.clone(),
            None => panic!("no mock session built yet"),
        }
    }

    /// Every publish across all sessions, in order
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.records
            .lock()
            .iter()
            .flat_map(|record| record.published.iter().cloned())
            .collect()
    }
}

impl SessionFactory for MockSessionFactory {
    type Session = MockSession;

    fn new_session(&self, params: SessionParams, events: EventEmitter) -> BridgeResult<MockSession> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(BridgeError::transport("mock session build failure"));
        }

        let mut records = self.records.lock();
        records.push(MockSessionRecord {
            session_id: events.session_id(),
            client_id: params.client_id,
            username: params.username,
            token: params.token,
            ca_bundle: params.ca_bundle,
            subscriptions: params.subscriptions,
            starts: Vec::new(),
            stops: 0,
            published: Vec::new(),
            emitter: events,
        });

        Ok(MockSession {
            index: records.len() - 1,
            records: Arc::clone(&self.records),
        })
    }
}

/// Session that records calls instead of doing I/O
#[derive(Debug)]
pub struct MockSession {
    index: usize,
    records: Arc<Mutex<Vec<MockSessionRecord>>>,
}

impl MockSession {
    fn with_record<T>(&self, f: impl FnOnce(&mut MockSessionRecord) -> T) -> Option<T> {
        self.records.lock().get_mut(self.index).map(f)
    }
}

impl TransportSession for MockSession {
    fn start(&mut self, host: &str, port: u16, keep_alive: Duration) -> BridgeResult<()> {
        self.with_record(|record| {
            record.starts.push((host.to_string(), port, keep_alive));
        });
        Ok(())
    }

    fn stop(&mut self) {
        self.with_record(|record| record.stops += 1);
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) {
        self.with_record(|record| record.published.push((topic.to_string(), payload, qos)));
    }
}
