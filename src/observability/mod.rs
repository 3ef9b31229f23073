//! Observability for the device bridge
//!
//! Structured logging only; the bridge exposes no metrics or health endpoints.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{lifecycle_span, session_span};
