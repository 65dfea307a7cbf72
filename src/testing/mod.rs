//! Testing utilities and mock implementations
//!
//! This module provides a fake broker transport so the session state machine
//! can be exercised without a running MQTT broker.

pub mod mocks;

pub use mocks::*;
