//! Device-side MQTT bridge client for a cloud IoT broker
//!
//! # Overview
//!
//! Keeps one device connected to the broker over TLS, authenticating each
//! session with a freshly signed 60-minute RS256 token:
//! - Token issuance from the device's RSA key
//! - A rumqttc transport session with transport-level reconnects
//! - A connection manager that rebuilds the whole session after any
//!   disconnect, because a plain reconnect stops config deliveries
//! - Optional caller callbacks whose failures never reach the event loop
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use iotcore_bridge::{BridgeConfig, EventSink, IotCoreClient};
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BridgeConfig::load_from_file(Path::new("bridge.toml"))?;
//! let sink = EventSink::new().with_on_message(|msg| {
//!     println!("{} -> {}", msg.topic, msg.payload_text());
//!     Ok(())
//! });
//!
//! let client = IotCoreClient::from_config(&config, sink)?;
//! client.connect()?;
//! client.publish("state", "online")?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod identity;
pub mod manager;
pub mod message;
pub mod observability;
pub mod sink;
pub mod testing;
pub mod transport;

pub use auth::{AuthToken, Credential, SigningKey, TokenIssuer};
pub use config::{BridgeConfig, ConfigError};
pub use error::{BridgeError, BridgeResult};
pub use identity::DeviceIdentity;
pub use manager::{ConnectionManager, ConnectionState, IotCoreClient, ManagerSettings};
pub use message::{InboundMessage, Payload};
pub use sink::EventSink;
pub use transport::{ResultCode, SessionEvent, SessionId, TransportSession};
