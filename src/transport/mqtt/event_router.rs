//! Pure routing of rumqttc poll results
//!
//! Maps each result of `EventLoop::poll` to a routing decision for the
//! session loop. Whether an error is a failed connect or a lost connection
//! depends on whether a ConnAck has been seen since the last error.

use crate::transport::ResultCode;
use bytes::Bytes;
use rumqttc::{ConnectReturnCode, ConnectionError, Event, Packet, SubscribeReasonCode};

/// Pure routing decisions for poll results
pub struct EventRouter;

impl EventRouter {
    pub fn route(polled: &Result<Event, ConnectionError>, connected: bool) -> EventRoute {
        match polled {
            Ok(Event::Incoming(packet)) => Self::route_incoming(packet),
            Ok(Event::Outgoing(_)) => EventRoute::OutgoingEvent,
            Err(ConnectionError::ConnectionRefused(code)) => EventRoute::ConnectionFailed {
                code: map_return_code(*code),
                reason: format!("broker refused connection: {code:?}"),
            },
            Err(ConnectionError::RequestsDone) => EventRoute::RequestsDone,
            Err(e) if connected => EventRoute::ConnectionLost(e.to_string()),
            Err(e) => EventRoute::ConnectionFailed {
                code: ResultCode::SERVER_UNAVAILABLE,
                reason: e.to_string(),
            },
        }
    }

    fn route_incoming(packet: &Packet) -> EventRoute {
        match packet {
            Packet::ConnAck(ack) => EventRoute::ConnectionAcknowledged(map_return_code(ack.code)),
            Packet::Publish(publish) => EventRoute::MessageReceived {
                topic: publish.topic.clone(),
                payload: publish.payload.clone(),
            },
            Packet::PubAck(ack) => EventRoute::PublishAcknowledged(ack.pkid),
            Packet::SubAck(suback) => EventRoute::SubscriptionAcknowledged {
                packet_id: suback.pkid,
                rejected: suback
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure)),
            },
            other => EventRoute::InfrastructureEvent(format!("{other:?}")),
        }
    }
}

/// Map an MQTT 3.1.1 CONNACK return code
pub fn map_return_code(code: ConnectReturnCode) -> ResultCode {
    match code {
        ConnectReturnCode::Success => ResultCode::SUCCESS,
        ConnectReturnCode::RefusedProtocolVersion => ResultCode::REFUSED_PROTOCOL_VERSION,
        ConnectReturnCode::BadClientId => ResultCode::REFUSED_IDENTIFIER,
        ConnectReturnCode::ServiceUnavailable => ResultCode::SERVER_UNAVAILABLE,
        ConnectReturnCode::BadUserNamePassword => ResultCode::BAD_CREDENTIALS,
        ConnectReturnCode::NotAuthorized => ResultCode::NOT_AUTHORIZED,
    }
}

/// Routing decisions for poll results
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// ConnAck received; subscriptions must be (re)issued
    ConnectionAcknowledged(ResultCode),
    /// Message received on subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// QoS 1 publish acknowledged
    PublishAcknowledged(u16),
    /// Subscription acknowledged, possibly refused by the broker
    SubscriptionAcknowledged { packet_id: u16, rejected: bool },
    /// Connect attempt failed before a ConnAck
    ConnectionFailed { code: ResultCode, reason: String },
    /// Established connection dropped
    ConnectionLost(String),
    /// Every client handle is gone; the loop can end
    RequestsDone,
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}
