//! Transport seam between the connection manager and the MQTT engine
//!
//! A [`TransportSession`] owns exactly one broker connection and runs its
//! network I/O on a background task. It reports what happens on that
//! connection as [`SessionEvent`]s through an [`EventEmitter`]; it never calls
//! back into the manager directly. Sessions are created by a
//! [`SessionFactory`] so the manager can be driven by mocks in tests.

use crate::auth::AuthToken;
use bytes::Bytes;
use rumqttc::QoS;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

pub mod mqtt;

/// Broker endpoint
pub const BROKER_HOST: &str = "mqtt.googleapis.com";
pub const BROKER_PORT: u16 = 8883;

/// The broker ignores the username; the token in the password authenticates
pub const UNUSED_USERNAME: &str = "unused";

/// Identifies one session built by a manager; never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Outcome code attached to connect and disconnect events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultCode(pub u8);

impl ResultCode {
    pub const SUCCESS: Self = Self(0);
    pub const REFUSED_PROTOCOL_VERSION: Self = Self(1);
    pub const REFUSED_IDENTIFIER: Self = Self(2);
    pub const SERVER_UNAVAILABLE: Self = Self(3);
    pub const BAD_CREDENTIALS: Self = Self(4);
    pub const NOT_AUTHORIZED: Self = Self(5);
    pub const CONNECTION_LOST: Self = Self(7);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    pub fn description(self) -> &'static str {
        match self.0 {
            0 => "success",
            1 => "refused, unacceptable protocol version",
            2 => "refused, identifier rejected",
            3 => "refused, server unavailable",
            4 => "refused, bad user name or password",
            5 => "not authorized",
            7 => "connection lost",
            _ => "unknown error",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.0, self.description())
    }
}

/// What a session reports about its connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A connect attempt finished; non-success codes mean it was refused or failed
    Connected(ResultCode),
    /// An established connection ended
    Disconnected(ResultCode),
    /// Broker delivered a message on a subscribed topic
    Message { topic: String, payload: Bytes },
    /// Broker acknowledged a QoS 1 publish
    PublishAck(u16),
}

/// Sending half of the manager's event queue, bound to one session
#[derive(Debug, Clone)]
pub struct EventEmitter {
    session_id: SessionId,
    tx: mpsc::UnboundedSender<(SessionId, SessionEvent)>,
}

impl EventEmitter {
    pub fn new(session_id: SessionId, tx: mpsc::UnboundedSender<(SessionId, SessionEvent)>) -> Self {
        Self { session_id, tx }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Queue an event without blocking. Dropped if the manager is gone.
    pub fn emit(&self, event: SessionEvent) {
        if self.tx.send((self.session_id, event)).is_err() {
            trace!(session = %self.session_id, "Event queue closed, dropping event");
        }
    }
}

/// Fixed construction parameters of one session
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub client_id: String,
    pub username: String,
    /// Token used as the MQTT password; owned by this session only
    pub token: AuthToken,
    /// PEM trust bundle for the broker's TLS certificate
    pub ca_bundle: Vec<u8>,
    /// Full topics subscribed after every ConnAck
    pub subscriptions: Vec<String>,
}

/// One physical broker connection
///
/// `start` and `stop` are non-blocking control calls. The manager serializes
/// them; implementations need not be safe against concurrent calls.
pub trait TransportSession: Send + 'static {
    /// Begin connecting in the background and start dispatching events
    fn start(&mut self, host: &str, port: u16, keep_alive: Duration) -> crate::BridgeResult<()>;

    /// Halt the event loop and close the connection. Idempotent.
    fn stop(&mut self);

    /// Fire-and-forget publish. Failures are not returned.
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS);
}

/// Builds sessions wired to the manager's event queue
pub trait SessionFactory: Send + Sync + 'static {
    type Session: TransportSession;

    fn new_session(
        &self,
        params: SessionParams,
        events: EventEmitter,
    ) -> crate::BridgeResult<Self::Session>;
}
