//! Impure I/O for one broker session
//!
//! Owns the rumqttc client and runs its event loop on a spawned task. Poll
//! results are classified by [`EventRouter`] and reported to the manager as
//! [`SessionEvent`]s. The event loop keeps polling after network errors,
//! which makes rumqttc reconnect with the same options (and token).

use super::event_router::{EventRoute, EventRouter};
use super::options::{configure_mqtt_options, ReconnectConfig};
use crate::error::{BridgeError, BridgeResult};
use crate::session_span;
use crate::transport::{
    EventEmitter, ResultCode, SessionEvent, SessionFactory, SessionParams, TransportSession,
};
use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, QoS};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn, Instrument};

/// Request queue depth between the client handle and the event loop
///
/// Publishes made before the first ConnAck wait here; once it is full,
/// further publishes are dropped with a warning.
pub const CLIENT_CAPACITY: usize = 1024;

/// How long a stopping session may spend sending its DISCONNECT
pub const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_millis(250);

/// Builds rumqttc-backed sessions
#[derive(Debug, Clone, Default)]
pub struct MqttSessionFactory {
    reconnect: ReconnectConfig,
}

impl MqttSessionFactory {
    pub fn new(reconnect: ReconnectConfig) -> Self {
        Self { reconnect }
    }

    pub fn reconnect_config(&self) -> &ReconnectConfig {
        &self.reconnect
    }
}

impl SessionFactory for MqttSessionFactory {
    type Session = MqttSession;

    fn new_session(&self, params: SessionParams, events: EventEmitter) -> BridgeResult<MqttSession> {
        self.reconnect
            .validate()
            .map_err(|e| BridgeError::Configuration(crate::config::ConfigError::InvalidConfig(e)))?;
        Ok(MqttSession::new(params, events, self.reconnect.clone()))
    }
}

/// One rumqttc connection and its event loop task
pub struct MqttSession {
    params: SessionParams,
    events: EventEmitter,
    reconnect: ReconnectConfig,
    started: bool,
    client: Option<AsyncClient>,
    shutdown_tx: Option<watch::Sender<bool>>,
    event_loop_handle: Option<JoinHandle<()>>,
}

impl MqttSession {
    pub fn new(params: SessionParams, events: EventEmitter, reconnect: ReconnectConfig) -> Self {
        Self {
            params,
            events,
            reconnect,
            started: false,
            client: None,
            shutdown_tx: None,
            event_loop_handle: None,
        }
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    /// True while the event loop task has not finished
    pub fn is_running(&self) -> bool {
        self.event_loop_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl TransportSession for MqttSession {
    fn start(&mut self, host: &str, port: u16, keep_alive: Duration) -> BridgeResult<()> {
        if self.started {
            return Err(BridgeError::transport(format!(
                "{} already started",
                self.events.session_id()
            )));
        }

        let runtime = Handle::try_current()
            .map_err(|e| BridgeError::transport(format!("no async runtime available: {e}")))?;
        let mqtt_options = configure_mqtt_options(&self.params, host, port, keep_alive)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, CLIENT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let span = session_span!(
            client_id = %self.params.client_id,
            session = %self.events.session_id()
        );
        let worker = EventLoopWorker {
            event_loop,
            client: client.clone(),
            events: self.events.clone(),
            subscriptions: self.params.subscriptions.clone(),
            reconnect: self.reconnect.clone(),
            shutdown_rx,
        };

        info!(
            session = %self.events.session_id(),
            host,
            port,
            keep_alive_secs = keep_alive.as_secs(),
            "Starting MQTT session"
        );

        self.event_loop_handle = Some(runtime.spawn(worker.run().instrument(span)));
        self.client = Some(client);
        self.shutdown_tx = Some(shutdown_tx);
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };

        // Queue the DISCONNECT before signalling; the worker flushes it on exit
        if let Err(e) = client.try_disconnect() {
            debug!(session = %self.events.session_id(), error = %e, "Could not queue DISCONNECT");
        }
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        // The task ends on its own after the flush window; the handle only observes it

        info!(session = %self.events.session_id(), "MQTT session stopped");
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) {
        let Some(client) = &self.client else {
            debug!(session = %self.events.session_id(), topic, "Publish on inactive session dropped");
            return;
        };

        if let Err(e) = client.try_publish(topic, qos, false, payload) {
            warn!(session = %self.events.session_id(), topic, error = %e, "Failed to queue publish");
        }
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by the spawned event loop task
struct EventLoopWorker {
    event_loop: EventLoop,
    client: AsyncClient,
    events: EventEmitter,
    subscriptions: Vec<String>,
    reconnect: ReconnectConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl EventLoopWorker {
    async fn run(mut self) {
        let mut connected = false;
        let mut attempts = 0u32;

        loop {
            let polled = tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                polled = self.event_loop.poll() => polled,
            };

            match EventRouter::route(&polled, connected) {
                EventRoute::ConnectionAcknowledged(code) => {
                    if code.is_success() {
                        connected = true;
                        attempts = 0;
                        info!("Connection acknowledged by broker");
                        self.subscribe_all();
                    }
                    self.events.emit(SessionEvent::Connected(code));
                }
                EventRoute::MessageReceived { topic, payload } => {
                    trace!(topic = %topic, bytes = payload.len(), "Message received");
                    self.events.emit(SessionEvent::Message { topic, payload });
                }
                EventRoute::PublishAcknowledged(packet_id) => {
                    self.events.emit(SessionEvent::PublishAck(packet_id));
                }
                EventRoute::SubscriptionAcknowledged { packet_id, rejected } => {
                    if rejected {
                        warn!(packet_id, "Broker rejected subscription");
                    } else {
                        debug!(packet_id, "Subscription confirmed");
                    }
                }
                EventRoute::ConnectionFailed { code, reason } => {
                    warn!(code = %code, reason = %reason, "Connect attempt failed");
                    self.events.emit(SessionEvent::Connected(code));
                    attempts += 1;
                    if !self.backoff(attempts).await {
                        break;
                    }
                }
                EventRoute::ConnectionLost(reason) => {
                    connected = false;
                    warn!(reason = %reason, "Connection lost");
                    self.events
                        .emit(SessionEvent::Disconnected(ResultCode::CONNECTION_LOST));
                    attempts += 1;
                    if !self.backoff(attempts).await {
                        break;
                    }
                }
                EventRoute::RequestsDone => {
                    debug!("All client handles dropped");
                    break;
                }
                EventRoute::InfrastructureEvent(event) => {
                    trace!(event = %event, "MQTT event");
                }
                EventRoute::OutgoingEvent => {}
            }
        }

        if connected {
            self.flush_disconnect().await;
        }
        info!("MQTT event loop stopped");
    }

    /// Subscribe at QoS 1 to every configured topic
    fn subscribe_all(&self) {
        for topic in &self.subscriptions {
            match self.client.try_subscribe(topic, QoS::AtLeastOnce) {
                Ok(()) => debug!(topic = %topic, "Subscribing"),
                Err(e) => warn!(topic = %topic, error = %e, "Failed to queue subscription"),
            }
        }
    }

    /// Sleep before the next reconnect attempt
    /// Returns false if shutdown was requested meanwhile
    async fn backoff(&mut self, attempt: u32) -> bool {
        let delay_ms = self.reconnect.calculate_backoff_delay(attempt);
        debug!(attempt, delay_ms, "Waiting before reconnect");
        interruptible_sleep(&mut self.shutdown_rx, delay_ms).await
    }

    /// Drive the loop until the queued DISCONNECT is written
    async fn flush_disconnect(&mut self) {
        let event_loop = &mut self.event_loop;
        let flushed = tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => return true,
                    Ok(_) => continue,
                    Err(_) => return false,
                }
            }
        })
        .await;

        match flushed {
            Ok(true) => debug!("DISCONNECT sent"),
            Ok(false) => debug!("Connection closed before DISCONNECT was sent"),
            Err(_) => debug!("Timed out sending DISCONNECT"),
        }
    }
}

/// Sleep with shutdown monitoring
/// Returns true if the sleep completed, false if shutdown was requested
async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay_ms: u64) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }

    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                info!("Shutdown signal received during reconnect delay");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}
