//! Testing utilities and mock implementations
//!
//! Lets the session layer be exercised without a running MQTT broker.

pub mod mocks;

pub use mocks::*;
