//! Error taxonomy for the bridge client
//!
//! Configuration and signing failures are fatal and returned to the caller.
//! Connection, transport and callback failures happen on the event path,
//! where there is no caller to return to; they are built as [`BridgeError`]
//! values so they log uniformly, then dropped.

use crate::config::ConfigError;
use crate::transport::ResultCode;
use thiserror::Error;

/// Main error type for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Token signing failed: {0}")]
    TokenSigning(#[source] jsonwebtoken::errors::Error),

    #[error("Connection refused by broker ({0})")]
    ConnectionRefused(ResultCode),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Event callback failed: {0}")]
    Callback(String),

    #[error("Not connected: no live session")]
    NotConnected,
}

impl BridgeError {
    /// Create transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Create callback error
    pub fn callback<S: Into<String>>(message: S) -> Self {
        Self::Callback(message.into())
    }

    /// Whether retrying the same operation could succeed
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::TokenSigning(_))
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
