//! Connection manager
//!
//! Owns the live [`TransportSession`] and serializes every lifecycle change
//! behind one lock. Session events arrive on an unbounded channel, drained
//! by a dispatcher task that is spawned on the first `connect()`. Each event
//! is tagged with the id of the session that produced it, and events from
//! any session other than the live one are dropped.
//!
//! Caller callbacks are invoked after the lock is released, so a callback may
//! call back into the manager.

pub mod state_machine;

use crate::auth::{Credential, TokenIssuer};
use crate::config::{BridgeConfig, ConfigError, MIN_KEEP_ALIVE_SECS};
use crate::error::{BridgeError, BridgeResult};
use crate::identity::DeviceIdentity;
use crate::lifecycle_span;
use crate::message::{InboundMessage, Payload};
use crate::sink::EventSink;
use crate::transport::mqtt::MqttSessionFactory;
use crate::transport::{
    EventEmitter, SessionEvent, SessionFactory, SessionId, SessionParams, TransportSession,
    BROKER_HOST, BROKER_PORT, UNUSED_USERNAME,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rumqttc::QoS;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

pub use state_machine::{Action, ConnectionState, Input};

/// Default keep-alive; short so dead links are noticed quickly
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(10);

/// Manager backed by the rumqttc transport
pub type IotCoreClient = ConnectionManager<MqttSessionFactory>;

type EventReceiver = mpsc::UnboundedReceiver<(SessionId, SessionEvent)>;

/// Construction parameters for a [`ConnectionManager`]
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub identity: DeviceIdentity,
    pub credential: Credential,
    pub keep_alive: Duration,
    /// Device-relative topics subscribed on every connect
    pub subscriptions: Vec<String>,
    pub sink: EventSink,
}

impl ManagerSettings {
    pub fn new(identity: DeviceIdentity, credential: Credential) -> Self {
        Self {
            identity,
            credential,
            keep_alive: DEFAULT_KEEP_ALIVE,
            subscriptions: vec!["config".to_string()],
            sink: EventSink::default(),
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_subscriptions(mut self, subscriptions: Vec<String>) -> Self {
        self.subscriptions = subscriptions;
        self
    }

    pub fn with_sink(mut self, sink: EventSink) -> Self {
        self.sink = sink;
        self
    }
}

/// Session currently registered to receive events
struct LiveSession<S> {
    id: SessionId,
    session: S,
    token_expires_at: DateTime<Utc>,
}

/// Everything guarded by the lifecycle lock
struct Lifecycle<S> {
    state: ConnectionState,
    disconnect_pending: bool,
    session: Option<LiveSession<S>>,
    next_session_id: u64,
}

impl<S> Lifecycle<S> {
    fn snapshot(&self) -> state_machine::Snapshot {
        state_machine::Snapshot {
            state: self.state,
            disconnect_pending: self.disconnect_pending,
            has_session: self.session.is_some(),
        }
    }

    fn live_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|live| live.id)
    }
}

struct Shared<F: SessionFactory> {
    identity: DeviceIdentity,
    client_id: String,
    credential: Credential,
    issuer: TokenIssuer,
    keep_alive: Duration,
    subscriptions: Vec<String>,
    factory: F,
    sink: EventSink,
    lifecycle: Mutex<Lifecycle<F::Session>>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::UnboundedSender<(SessionId, SessionEvent)>,
    events_rx: Mutex<Option<EventReceiver>>,
}

/// Keeps one device connected and rebuilds its session after disconnects
///
/// Cloning yields another handle to the same manager.
pub struct ConnectionManager<F: SessionFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: SessionFactory> Clone for ConnectionManager<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: SessionFactory> std::fmt::Debug for ConnectionManager<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("client_id", &self.shared.client_id)
            .field("state", &self.state())
            .field("disconnect_pending", &self.disconnect_pending())
            .field("session", &self.current_session())
            .finish()
    }
}

impl IotCoreClient {
    /// Build a manager from a configuration file's contents
    ///
    /// Loads key material from the configured paths; fails if either file is
    /// unreadable or unusable.
    pub fn from_config(config: &BridgeConfig, sink: EventSink) -> BridgeResult<Self> {
        config.validate()?;
        let credential = Credential::load(
            &config.credentials.private_key_path,
            &config.credentials.ca_cert_path,
        )?;

        let settings = ManagerSettings::new(config.identity(), credential)
            .with_keep_alive(config.keep_alive())
            .with_subscriptions(config.mqtt.subscriptions.clone())
            .with_sink(sink);

        Self::new(settings, MqttSessionFactory::new(config.reconnect_config()))
    }
}

impl<F: SessionFactory> ConnectionManager<F> {
    pub fn new(settings: ManagerSettings, factory: F) -> BridgeResult<Self> {
        settings.identity.validate()?;
        if settings.keep_alive < Duration::from_secs(MIN_KEEP_ALIVE_SECS) {
            return Err(ConfigError::InvalidConfig(format!(
                "keep-alive must be at least {MIN_KEEP_ALIVE_SECS}s"
            ))
            .into());
        }

        let subscriptions = settings
            .subscriptions
            .iter()
            .map(|topic| settings.identity.device_topic(topic))
            .collect();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            shared: Arc::new(Shared {
                client_id: settings.identity.client_id(),
                identity: settings.identity,
                credential: settings.credential,
                issuer: TokenIssuer::new(),
                keep_alive: settings.keep_alive,
                subscriptions,
                factory,
                sink: settings.sink,
                lifecycle: Mutex::new(Lifecycle {
                    state: ConnectionState::Disconnected,
                    disconnect_pending: false,
                    session: None,
                    next_session_id: 0,
                }),
                state_tx,
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        })
    }

    /// Build and start a session if none exists
    ///
    /// Returns once the session is started; the outcome of the connect
    /// arrives later as an `on_connect` callback. A no-op while a session
    /// already exists.
    pub fn connect(&self) -> BridgeResult<()> {
        self.ensure_dispatcher();
        self.apply(Input::ConnectRequested, None)
    }

    /// Stop and discard the live session. Idempotent.
    ///
    /// Does not clear a pending disconnect: if the device disconnected
    /// before, the next successful connect still rebuilds.
    pub fn disconnect(&self) {
        if let Err(e) = self.apply(Input::DisconnectRequested, None) {
            error!(error = %e, "Disconnect failed");
        }
    }

    /// Publish to `/devices/<device_id>/<topic>` at QoS 1
    ///
    /// Fire-and-forget: only the absence of a live session is an error.
    pub fn publish(&self, topic: &str, payload: impl Into<Payload>) -> BridgeResult<()> {
        let payload = payload.into();
        let full_topic = self.shared.identity.device_topic(topic);

        let lifecycle = self.shared.lifecycle.lock();
        let live = lifecycle.session.as_ref().ok_or(BridgeError::NotConnected)?;

        debug!(session = %live.id, topic = %full_topic, "Publishing");
        live.session
            .publish(&full_topic, payload.into_bytes(), QoS::AtLeastOnce);
        Ok(())
    }

    /// Handle one event reported by a session
    ///
    /// Called by the dispatcher task; public so events can be pumped
    /// without an async runtime.
    pub fn handle_session_event(&self, from: SessionId, event: SessionEvent) {
        match event {
            SessionEvent::Connected(code) => {
                if let Err(e) = self.apply(Input::SessionConnected(code), Some(from)) {
                    error!(session = %from, error = %e, "Session rebuild failed");
                }
            }
            SessionEvent::Disconnected(code) => {
                if let Err(e) = self.apply(Input::SessionDisconnected(code), Some(from)) {
                    error!(session = %from, error = %e, "Failed to handle disconnect");
                }
            }
            SessionEvent::Message { topic, payload } => {
                if self.current_session() != Some(from) {
                    debug!(session = %from, topic = %topic, "Dropping message from stale session");
                    return;
                }
                let message = InboundMessage::new(topic, payload);
                info!(topic = %message.topic, payload = %message.payload_text(), "Received message");
                // Failures are logged by the sink and go no further
                let _ = self.shared.sink.deliver_message(&message);
            }
            SessionEvent::PublishAck(packet_id) => {
                debug!(session = %from, packet_id, "Publish acknowledged");
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lifecycle.lock().state
    }

    pub fn disconnect_pending(&self) -> bool {
        self.shared.lifecycle.lock().disconnect_pending
    }

    /// Id of the live session, if any
    pub fn current_session(&self) -> Option<SessionId> {
        self.shared.lifecycle.lock().live_id()
    }

    /// Expiry of the live session's token
    pub fn token_expires_at(&self) -> Option<DateTime<Utc>> {
        self.shared
            .lifecycle
            .lock()
            .session
            .as_ref()
            .map(|live| live.token_expires_at)
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.shared.identity
    }

    /// Observe state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Run one input through the transition table and execute its actions
    ///
    /// `origin` is the session an event came from; events from anything but
    /// the live session are ignored.
    fn apply(&self, input: Input, origin: Option<SessionId>) -> BridgeResult<()> {
        let _span = lifecycle_span!(input = ?input).entered();
        let mut notifications = Vec::new();

        let result = {
            let mut lifecycle = self.shared.lifecycle.lock();

            if let Some(from) = origin {
                if lifecycle.live_id() != Some(from) {
                    debug!(session = %from, "Ignoring event from stale session");
                    return Ok(());
                }
            }

            let before = lifecycle.snapshot();
            let transition = state_machine::transition(before, input);
            if transition.rebuilds() {
                info!("Reconnected after a disconnect, rebuilding session");
            }
            lifecycle.state = transition.state;
            lifecycle.disconnect_pending = transition.disconnect_pending;

            let result = self.execute(&mut lifecycle, &transition.actions, &mut notifications);
            if result.is_err() {
                // Nothing was started: the pending flag still applies and no one is connected
                lifecycle.state = ConnectionState::Disconnected;
                lifecycle.disconnect_pending = before.disconnect_pending;
                notifications.clear();
            }
            self.shared.state_tx.send_replace(lifecycle.state);
            result
        };

        for action in notifications {
            match action {
                Action::NotifyConnected => self.shared.sink.notify_connected(),
                Action::NotifyDisconnected => self.shared.sink.notify_disconnected(),
                _ => {}
            }
        }
        result
    }

    /// Execute session actions under the lock; notifications are deferred
    fn execute(
        &self,
        lifecycle: &mut Lifecycle<F::Session>,
        actions: &[Action],
        notifications: &mut Vec<Action>,
    ) -> BridgeResult<()> {
        let mut built = None;

        for action in actions {
            match *action {
                Action::BuildSession => built = Some(self.build_session(lifecycle)?),
                Action::StartSession => {
                    if let Some(mut live) = built.take() {
                        live.session
                            .start(BROKER_HOST, BROKER_PORT, self.shared.keep_alive)?;
                        info!(session = %live.id, client_id = %self.shared.client_id, "Session started");
                        lifecycle.session = Some(live);
                    }
                }
                Action::StopSession => {
                    if let Some(mut live) = lifecycle.session.take() {
                        live.session.stop();
                        debug!(session = %live.id, "Session discarded");
                    }
                }
                Action::ReportConnectFailure(code) => {
                    let e = BridgeError::ConnectionRefused(code);
                    error!(error = %e, "Error connecting to broker");
                }
                Action::ReportAbnormalDisconnect(code) => {
                    let e = BridgeError::transport(format!("unexpected disconnect ({code})"));
                    error!(error = %e, "Connection to broker lost");
                }
                Action::NotifyConnected | Action::NotifyDisconnected => notifications.push(*action),
            }
        }
        Ok(())
    }

    /// Issue a fresh token and construct an unstarted session
    fn build_session(
        &self,
        lifecycle: &mut Lifecycle<F::Session>,
    ) -> BridgeResult<LiveSession<F::Session>> {
        lifecycle.next_session_id += 1;
        let id = SessionId(lifecycle.next_session_id);

        let token = self
            .shared
            .issuer
            .issue(&self.shared.identity, self.shared.credential.signing_key())?;
        let token_expires_at = token.expires_at();

        let params = SessionParams {
            client_id: self.shared.client_id.clone(),
            username: UNUSED_USERNAME.to_string(),
            token,
            ca_bundle: self.shared.credential.ca_bundle().to_vec(),
            subscriptions: self.shared.subscriptions.clone(),
        };
        let session = self
            .shared
            .factory
            .new_session(params, EventEmitter::new(id, self.shared.events_tx.clone()))?;

        debug!(session = %id, token_expires_at = %token_expires_at, "Session built");
        Ok(LiveSession {
            id,
            session,
            token_expires_at,
        })
    }

    /// Spawn the event dispatcher once, if a runtime is available
    fn ensure_dispatcher(&self) {
        let mut slot = self.shared.events_rx.lock();
        if slot.is_none() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            debug!("No async runtime; session events must be pumped by the caller");
            return;
        };
        if let Some(events_rx) = slot.take() {
            runtime.spawn(dispatch_events(Arc::downgrade(&self.shared), events_rx));
        }
    }
}

/// Drain session events until the manager or every sender is gone
async fn dispatch_events<F: SessionFactory>(shared: Weak<Shared<F>>, mut events_rx: EventReceiver) {
    while let Some((from, event)) = events_rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        ConnectionManager { shared }.handle_session_event(from, event);
    }
    debug!("Event dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{test_credential, test_identity, MockSessionFactory};
    use crate::transport::ResultCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(sink: EventSink) -> (ConnectionManager<MockSessionFactory>, MockSessionFactory) {
        let factory = MockSessionFactory::new();
        let settings = ManagerSettings::new(test_identity(), test_credential()).with_sink(sink);
        let manager = ConnectionManager::new(settings, factory.clone()).unwrap();
        (manager, factory)
    }

    #[test]
    fn test_new_rejects_short_keep_alive() {
        let settings = ManagerSettings::new(test_identity(), test_credential())
            .with_keep_alive(Duration::from_secs(1));
        let result = ConnectionManager::new(settings, MockSessionFactory::new());
        assert!(matches!(result, Err(BridgeError::Configuration(_))));
    }

    #[test]
    fn test_new_rejects_invalid_identity() {
        let settings = ManagerSettings::new(
            DeviceIdentity::new("proj", "region", "reg", "bad/device"),
            test_credential(),
        );
        let result = ConnectionManager::new(settings, MockSessionFactory::new());
        assert!(matches!(result, Err(BridgeError::Configuration(_))));
    }

    #[test]
    fn test_connect_builds_and_starts_one_session() {
        let (manager, factory) = manager(EventSink::new());

        manager.connect().unwrap();

        assert_eq!(factory.session_count(), 1);
        let session = factory.session(0);
        assert_eq!(session.starts.len(), 1);
        assert_eq!(session.starts[0].0, BROKER_HOST);
        assert_eq!(session.starts[0].1, BROKER_PORT);
        assert_eq!(session.starts[0].2, DEFAULT_KEEP_ALIVE);
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(manager.current_session(), Some(session.session_id));
    }

    #[test]
    fn test_session_params() {
        let (manager, factory) = manager(EventSink::new());
        manager.connect().unwrap();

        let session = factory.session(0);
        assert_eq!(session.client_id, manager.client_id());
        assert_eq!(session.username, "unused");
        assert_eq!(session.subscriptions, vec!["/devices/test-device/config"]);
        assert!(!session.ca_bundle.is_empty());
    }

    #[test]
    fn test_connect_twice_is_noop() {
        let (manager, factory) = manager(EventSink::new());

        manager.connect().unwrap();
        manager.connect().unwrap();

        assert_eq!(factory.session_count(), 1);
        assert_eq!(factory.session(0).starts.len(), 1);
    }

    #[test]
    fn test_failed_session_build_leaves_manager_idle() {
        let factory = MockSessionFactory::new();
        factory.fail_next_build();
        let settings = ManagerSettings::new(test_identity(), test_credential());
        let manager = ConnectionManager::new(settings, factory.clone()).unwrap();

        assert!(manager.connect().is_err());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.current_session(), None);

        // A later connect can succeed
        manager.connect().unwrap();
        assert_eq!(manager.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_stale_session_events_ignored() {
        let connects = Arc::new(AtomicUsize::new(0));
        let c = connects.clone();
        let (manager, _factory) = manager(EventSink::new().with_on_connect(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        manager.connect().unwrap();
        manager.handle_session_event(SessionId(99), SessionEvent::Connected(ResultCode::SUCCESS));

        assert_eq!(connects.load(Ordering::SeqCst), 0);
        assert_eq!(manager.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_publish_without_session_is_error() {
        let (manager, _factory) = manager(EventSink::new());
        assert!(matches!(
            manager.publish("state", "hello"),
            Err(BridgeError::NotConnected)
        ));
    }

    #[test]
    fn test_watch_state_follows_transitions() {
        let (manager, _factory) = manager(EventSink::new());
        let state_rx = manager.watch_state();
        assert_eq!(*state_rx.borrow(), ConnectionState::Disconnected);

        manager.connect().unwrap();
        let id = manager.current_session().unwrap();
        manager.handle_session_event(id, SessionEvent::Connected(ResultCode::SUCCESS));

        assert_eq!(*state_rx.borrow(), ConnectionState::Connected);
    }

    #[test]
    fn test_token_expiry_tracks_live_session() {
        let (manager, factory) = manager(EventSink::new());
        assert!(manager.token_expires_at().is_none());

        manager.connect().unwrap();
        assert_eq!(
            manager.token_expires_at(),
            Some(factory.session(0).token.expires_at())
        );
    }

    #[test]
    fn test_callback_may_reenter_manager() {
        let slot: Arc<Mutex<Option<ConnectionManager<MockSessionFactory>>>> =
            Arc::new(Mutex::new(None));
        let slot_clone = slot.clone();
        let (manager, _factory) = manager(EventSink::new().with_on_connect(move || {
            if let Some(manager) = slot_clone.lock().as_ref() {
                manager.disconnect();
            }
        }));
        *slot.lock() = Some(manager.clone());

        manager.connect().unwrap();
        let id = manager.current_session().unwrap();
        manager.handle_session_event(id, SessionEvent::Connected(ResultCode::SUCCESS));

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.current_session(), None);

        // Break the reference cycle
        slot.lock().take();
    }
}
