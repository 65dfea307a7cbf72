//! MQTT Subscriber - Rust Implementation
//!
//! A resilient publish/subscribe client plus a thread-safe, file-backed
//! document store.
//!
//! # Overview
//!
//! This crate provides:
//! - A connection state machine with bounded retries and reconnect backoff
//! - Subscription bookkeeping that re-converges after every reconnect
//! - Outbound publishing and single-handler inbound dispatch
//! - A keyed JSON document store with atomic read-modify-write operations
//!
//! # Quick Start
//!
//! ```rust
//! use mqtt_subscriber::store::DocumentStore;
//! use serde_json::json;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let store = DocumentStore::new(dir.path().join("users.json"));
//!
//! store.append(json!({"id": 42, "name": "ada"}).as_object().unwrap().clone()).unwrap();
//!
//! let found = store.find_by_key("id", 42).unwrap();
//! assert_eq!(found.unwrap()["name"], "ada");
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod store;
pub mod testing;
pub mod transport;

pub use config::{ClientConfig, ConfigError};
pub use error::{AppError, AppResult};
pub use store::{DocumentStore, Record, StoreError};
pub use transport::mqtt::{
    ClientError, ConnectionState, MessageHandler, MqttClient, Subscription, SubscriptionTracker,
};
pub use transport::{Connector, EventSource, Link, QoS, TransportError, TransportEvent};
