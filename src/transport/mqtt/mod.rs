//! rumqttc-backed transport session
//!
//! Pure functions are kept apart from I/O:
//!
//! - [`options`] - MqttOptions construction and reconnect policy
//! - [`event_router`] - classification of event loop poll results
//! - [`session`] - the spawned event loop and client handle
//!
//! # Usage
//!
//! ```rust,no_run
//! use iotcore_bridge::transport::mqtt::{MqttSessionFactory, ReconnectConfig};
//!
//! let factory = MqttSessionFactory::new(ReconnectConfig::default());
//! # let _ = factory;
//! ```

pub mod event_router;
pub mod options;
pub mod session;

pub use event_router::{EventRoute, EventRouter};
pub use options::{configure_mqtt_options, ReconnectConfig, MAX_PACKET_SIZE};
pub use session::{MqttSession, MqttSessionFactory};
