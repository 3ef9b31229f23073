//! Testing utilities and mock implementations
//!
//! Lets the connection manager be driven without a broker or network.

pub mod mocks;

pub use mocks::*;
