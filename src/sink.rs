//! Caller-supplied event callbacks
//!
//! Every callback is optional; an absent callback is a no-op. Callbacks run
//! on the event delivery task and must return quickly. A callback that
//! returns an error or panics is logged and contained so the delivery loop
//! keeps running.

use crate::error::BridgeError;
use crate::message::InboundMessage;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// Error a message callback may return
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

pub type MessageCallback =
    Arc<dyn Fn(&InboundMessage) -> Result<(), CallbackError> + Send + Sync>;

pub type LifecycleCallback = Arc<dyn Fn() + Send + Sync>;

/// Set of optional callbacks invoked by the connection manager
#[derive(Clone, Default)]
pub struct EventSink {
    pub on_message: Option<MessageCallback>,
    pub on_connect: Option<LifecycleCallback>,
    pub on_disconnect: Option<LifecycleCallback>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_on_message<F>(mut self, callback: F) -> Self
    where
        F: Fn(&InboundMessage) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(callback));
        self
    }

    pub fn with_on_connect<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(callback));
        self
    }

    pub fn with_on_disconnect<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(callback));
        self
    }

    /// Hand a message to `on_message`, containing any failure
    pub fn deliver_message(&self, message: &InboundMessage) -> Result<(), BridgeError> {
        let Some(callback) = &self.on_message else {
            return Ok(());
        };

        let outcome = match catch_unwind(AssertUnwindSafe(|| callback(message))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BridgeError::callback(e.to_string())),
            Err(panic) => Err(BridgeError::callback(panic_message(panic.as_ref()))),
        };

        if let Err(e) = &outcome {
            error!(topic = %message.topic, error = %e, "Uncaught failure in on_message callback");
        }
        outcome
    }

    pub fn notify_connected(&self) {
        if let Some(callback) = &self.on_connect {
            Self::run_lifecycle_callback("on_connect", callback);
        }
    }

    pub fn notify_disconnected(&self) {
        if let Some(callback) = &self.on_disconnect {
            Self::run_lifecycle_callback("on_disconnect", callback);
        }
    }

    fn run_lifecycle_callback(name: &str, callback: &LifecycleCallback) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback())) {
            let e = BridgeError::callback(panic_message(panic.as_ref()));
            error!(callback = name, error = %e, "Uncaught panic in lifecycle callback");
        }
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("on_message", &self.on_message.is_some())
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}
